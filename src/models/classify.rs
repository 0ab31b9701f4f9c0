//! Workload classification.
//!
//! A build is classified once, as a (complexity, size) pair, from keyword
//! scoring over free text and the shape of the plan. An optional semantic
//! classifier can be fused in. Wherever two tiers tie, the higher tier wins.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::core::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub complexity: Complexity,
    pub size: WorkloadSize,
}

impl Classification {
    pub const LOWEST: Classification = Classification {
        complexity: Complexity::Simple,
        size: WorkloadSize::Small,
    };

    pub fn new(complexity: Complexity, size: WorkloadSize) -> Self {
        Self { complexity, size }
    }

    /// The lowest classification skips the review phase.
    pub fn is_lowest(&self) -> bool {
        *self == Self::LOWEST
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::new(Complexity::Medium, WorkloadSize::Medium)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let complexity = match self.complexity {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Heavy => "heavy",
        };
        let size = match self.size {
            WorkloadSize::Small => "small",
            WorkloadSize::Medium => "medium",
            WorkloadSize::Large => "large",
        };
        write!(f, "{}/{}", complexity, size)
    }
}

const SIMPLE_WORDS: &[&str] = &[
    "simple", "basic", "hello world", "tiny", "toy", "quick", "minimal", "example", "demo",
    "snippet", "script",
];
const MEDIUM_WORDS: &[&str] = &[
    "api", "crud", "rest", "cli", "service", "database", "parser", "web app", "auth",
    "tests", "module", "scraper",
];
const HEAVY_WORDS: &[&str] = &[
    "distributed", "compiler", "microservices", "concurrent", "scalable", "architecture",
    "framework", "engine", "real-time", "realtime", "multi-tenant", "cryptography",
    "consensus", "optimization",
];

const SMALL_WORDS: &[&str] = &[
    "single file", "one file", "function", "snippet", "script", "small", "single",
];
const MEDIUM_SIZE_WORDS: &[&str] = &[
    "several files", "few files", "package", "module", "app", "application", "service",
];
const LARGE_WORDS: &[&str] = &[
    "full", "complete", "platform", "system", "monorepo", "enterprise", "large",
    "multiple services", "end-to-end",
];

/// One whole-word pattern per keyword.
fn compile(words: &[&str]) -> Vec<Regex> {
    words
        .iter()
        .filter_map(|w| Regex::new(&format!(r"\b{}\b", regex::escape(w))).ok())
        .collect()
}

static SIMPLE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(SIMPLE_WORDS));
static MEDIUM: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(MEDIUM_WORDS));
static HEAVY: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(HEAVY_WORDS));
static SMALL: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(SMALL_WORDS));
static MEDIUM_SIZE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(MEDIUM_SIZE_WORDS));
static LARGE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(LARGE_WORDS));

/// Number of distinct keywords of a bucket present in `text`.
fn score(text: &str, bucket: &[Regex]) -> usize {
    bucket.iter().filter(|re| re.is_match(text)).count()
}

/// Index of the winning bucket. Ties go to the later (higher) bucket;
/// no signal at all gives the middle bucket.
fn pick(scores: [usize; 3]) -> usize {
    if scores.iter().all(|&s| s == 0) {
        return 1;
    }
    let best = scores.iter().copied().max().unwrap_or(0);
    scores.iter().rposition(|&s| s == best).unwrap_or(1)
}

/// Classify free text by keyword buckets.
pub fn classify_text(text: &str) -> Classification {
    let text = text.to_lowercase();
    let complexity = match pick([
        score(&text, &SIMPLE),
        score(&text, &MEDIUM),
        score(&text, &HEAVY),
    ]) {
        0 => Complexity::Simple,
        1 => Complexity::Medium,
        _ => Complexity::Heavy,
    };
    let size = match pick([
        score(&text, &SMALL),
        score(&text, &MEDIUM_SIZE),
        score(&text, &LARGE),
    ]) {
        0 => WorkloadSize::Small,
        1 => WorkloadSize::Medium,
        _ => WorkloadSize::Large,
    };
    Classification::new(complexity, size)
}

fn size_for_task_count(count: usize) -> WorkloadSize {
    match count {
        0..=2 => WorkloadSize::Small,
        3..=8 => WorkloadSize::Medium,
        _ => WorkloadSize::Large,
    }
}

fn bump(complexity: Complexity) -> Complexity {
    match complexity {
        Complexity::Simple => Complexity::Medium,
        _ => Complexity::Heavy,
    }
}

/// Plan summary followed by every task description, one per line.
pub fn plan_text(plan: &Plan) -> String {
    let mut text = plan.summary.clone();
    for task in &plan.tasks {
        text.push('\n');
        text.push_str(&task.description);
    }
    text
}

/// Classify a materialized plan.
///
/// Text signal comes from the summary and task descriptions. The task count
/// sets a size floor, and a dependency chain of `depth` four or more raises
/// complexity by one tier.
pub fn classify_plan(plan: &Plan, depth: usize) -> Classification {
    let text = plan_text(plan);
    let keyword = if text.trim().is_empty() {
        Classification::LOWEST
    } else {
        classify_text(&text)
    };

    let complexity = if depth >= 4 {
        bump(keyword.complexity)
    } else {
        keyword.complexity
    };
    let size = keyword.size.max(size_for_task_count(plan.tasks.len()));
    Classification::new(complexity, size)
}

/// Merge a keyword classification with an optional semantic one, taking the
/// higher tier on each axis.
pub fn fuse(keyword: Classification, semantic: Option<Classification>) -> Classification {
    match semantic {
        Some(s) => Classification::new(
            keyword.complexity.max(s.complexity),
            keyword.size.max(s.size),
        ),
        None => keyword,
    }
}

/// A cheap model-backed second opinion on the classification.
#[async_trait]
pub trait SemanticClassifier: Send + Sync {
    /// `None` when the classifier could not produce an answer.
    async fn classify(&self, text: &str) -> Option<Classification>;
}
