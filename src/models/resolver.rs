//! Role → model resolution with fallback search and escalation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::models::classify::{Classification, Complexity, WorkloadSize};
use crate::models::registry::{Category, ModelRegistry, ModelSpec, SizeClass};
use crate::{flog_debug, flog_error};

/// Pipeline roles that need a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Generator,
    Reviewer,
    Analyzer,
    Coder,
    Summarizer,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Planner,
        Role::Generator,
        Role::Reviewer,
        Role::Analyzer,
        Role::Coder,
        Role::Summarizer,
    ];

    /// Diagnostic and planning roles escalate towards reasoning models.
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, Role::Planner | Role::Analyzer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Generator => "generator",
            Role::Reviewer => "reviewer",
            Role::Analyzer => "analyzer",
            Role::Coder => "coder",
            Role::Summarizer => "summarizer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a role needs under a given classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub category: Category,
    pub size: SizeClass,
}

/// The static role × classification table.
pub fn requirement(role: Role, classification: Classification) -> Requirement {
    let Classification { complexity, size } = classification;
    // Base size from complexity; a large workload lifts simple work one step.
    let base = match complexity {
        Complexity::Simple if size == WorkloadSize::Large => SizeClass::Medium,
        Complexity::Simple => SizeClass::Small,
        Complexity::Medium if size == WorkloadSize::Large => SizeClass::Large,
        Complexity::Medium => SizeClass::Medium,
        Complexity::Heavy => SizeClass::Large,
    };

    let (category, size) = match role {
        Role::Generator | Role::Coder => (Category::Coding, base),
        Role::Reviewer => match complexity {
            Complexity::Heavy => (Category::Reasoning, SizeClass::Large),
            _ => (Category::Coding, base),
        },
        Role::Planner | Role::Analyzer => (Category::Reasoning, base),
        Role::Summarizer => match size {
            WorkloadSize::Large => (Category::Summarizer, SizeClass::Medium),
            _ => (Category::Summarizer, SizeClass::Small),
        },
    };
    Requirement { category, size }
}

/// Resolved model per role for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTable {
    models: BTreeMap<Role, String>,
}

impl RoleTable {
    pub fn get(&self, role: Role) -> Option<&str> {
        self.models.get(&role).map(String::as_str)
    }

    pub fn insert(&mut self, role: Role, model: String) {
        self.models.insert(role, model);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Role, &String)> {
        self.models.iter()
    }
}

/// Resolves roles to concrete models against a registry's available set.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    registry: Arc<ModelRegistry>,
    default_model: String,
}

impl ModelResolver {
    pub fn new(registry: Arc<ModelRegistry>, default_model: &str) -> Self {
        Self {
            registry,
            default_model: default_model.to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Pick a model for `role`.
    ///
    /// Search order, first hit wins:
    /// 1. exact category and size
    /// 2. same category, larger sizes first (nearest), then smaller
    /// 3. the category's fallback categories, in order, ranked as in 2
    /// 4. any available non-embedding model, then the configured default
    ///
    /// Ties within a tier break on priority, then name. Returns `None` only
    /// if nothing is available and the default model is empty.
    pub fn resolve(&self, role: Role, classification: Classification) -> Option<String> {
        let req = requirement(role, classification);
        let available = self.registry.available();

        let exact = available
            .iter()
            .filter(|s| s.category == req.category && s.size == req.size)
            .min_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
        if let Some(spec) = exact {
            flog_debug!("resolve {} ({}): exact match {}", role, classification, spec.name);
            return Some(spec.name.clone());
        }

        if let Some(spec) = best_in_category(&available, req.category, req.size) {
            flog_debug!("resolve {} ({}): same category {}", role, classification, spec.name);
            return Some(spec.name.clone());
        }

        for category in req.category.fallback_order() {
            if let Some(spec) = best_in_category(&available, *category, req.size) {
                flog_debug!(
                    "resolve {} ({}): fell back to {} model {}",
                    role,
                    classification,
                    category,
                    spec.name
                );
                return Some(spec.name.clone());
            }
        }

        let any = available
            .iter()
            .filter(|s| s.category != Category::Embedding)
            .min_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
        if let Some(spec) = any {
            flog_debug!("resolve {} ({}): using any available {}", role, classification, spec.name);
            return Some(spec.name.clone());
        }

        if self.default_model.is_empty() {
            flog_error!("resolve {} ({}): no model available and no default", role, classification);
            return None;
        }
        flog_error!(
            "resolve {} ({}): no suitable model available, degrading to default {}",
            role,
            classification,
            self.default_model
        );
        Some(self.default_model.clone())
    }

    /// A stronger model for one retry of `role`.
    ///
    /// Only models at least as large as the role's baseline requirement are
    /// considered. Returns `None` when nothing qualifies.
    pub fn escalate(&self, role: Role, classification: Classification) -> Option<String> {
        let baseline = requirement(role, classification).size;
        let available = self.registry.available();

        let preferred: &[(Category, SizeClass)] = if role.is_diagnostic() {
            &[
                (Category::Reasoning, SizeClass::Large),
                (Category::Reasoning, SizeClass::Medium),
                (Category::Coding, SizeClass::Large),
            ]
        } else {
            &[
                (Category::Coding, SizeClass::Large),
                (Category::Reasoning, SizeClass::Large),
                (Category::Reasoning, SizeClass::Medium),
            ]
        };

        for &(category, size) in preferred.iter().filter(|(_, size)| *size >= baseline) {
            let hit = available
                .iter()
                .filter(|s| s.category == category && s.size == size)
                .min_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
            if let Some(spec) = hit {
                flog_debug!("escalate {}: {} ({} {})", role, spec.name, category, size);
                return Some(spec.name.clone());
            }
        }

        let fallback = available
            .iter()
            .filter(|s| s.category != Category::Embedding && s.size >= baseline)
            .min_by(|a, b| {
                (std::cmp::Reverse(a.size), a.priority, &a.name)
                    .cmp(&(std::cmp::Reverse(b.size), b.priority, &b.name))
            });
        match fallback {
            Some(spec) => {
                flog_debug!("escalate {}: largest available {}", role, spec.name);
                Some(spec.name.clone())
            }
            None => {
                flog_debug!("escalate {}: nothing at or above {}", role, baseline);
                None
            }
        }
    }

    /// Resolve every role once for a build.
    pub fn table(&self, classification: Classification) -> RoleTable {
        let mut table = RoleTable::default();
        for role in Role::ALL {
            if let Some(model) = self.resolve(role, classification) {
                table.insert(role, model);
            }
        }
        table
    }

    /// Deduplicated set of models a build with this classification needs.
    pub fn required_units(&self, classification: Classification) -> BTreeSet<String> {
        Role::ALL
            .iter()
            .filter_map(|role| self.resolve(*role, classification))
            .collect()
    }
}

/// Best model in `category` for a requested size: sizes at or above the
/// request ascending, then smaller sizes descending, then priority and name.
fn best_in_category<'a>(
    available: &[&'a ModelSpec],
    category: Category,
    size: SizeClass,
) -> Option<&'a ModelSpec> {
    available
        .iter()
        .copied()
        .filter(|s| s.category == category)
        .min_by_key(|s| {
            let distance = if s.size >= size {
                (0, s.size as u8 - size as u8)
            } else {
                (1, size as u8 - s.size as u8)
            };
            (distance, s.priority, s.name.clone())
        })
}
