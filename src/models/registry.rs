//! Registry of model descriptors and their local availability.
//!
//! The descriptor list is fixed once the registry is built. Availability is
//! cached: `init` fills the cache once, `refresh` re-queries the source and
//! `invalidate` drops the cache so the next `init` queries again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::{flog, flog_debug, flog_warn};

/// Capability category of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Coding,
    Reasoning,
    General,
    Fast,
    Agentic,
    Summarizer,
    Embedding,
}

impl Category {
    /// Categories tried, in order, when nothing in `self` is available.
    pub fn fallback_order(&self) -> &'static [Category] {
        match self {
            Category::Coding => &[Category::General, Category::Agentic, Category::Fast],
            Category::Reasoning => &[Category::General, Category::Coding, Category::Agentic],
            Category::General => &[Category::Coding, Category::Reasoning, Category::Fast],
            Category::Fast => &[Category::General, Category::Coding],
            Category::Agentic => &[Category::Coding, Category::General, Category::Reasoning],
            Category::Summarizer => &[Category::General, Category::Fast],
            Category::Embedding => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Coding => "coding",
            Category::Reasoning => "reasoning",
            Category::General => "general",
            Category::Fast => "fast",
            Category::Agentic => "agentic",
            Category::Summarizer => "summarizer",
            Category::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter-count class of a model. Ordered small < medium < large.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeClass::Small => write!(f, "small"),
            SizeClass::Medium => write!(f, "medium"),
            SizeClass::Large => write!(f, "large"),
        }
    }
}

fn default_priority() -> u32 {
    10
}

fn default_context_window() -> u32 {
    8192
}

/// Static description of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub category: Category,
    pub size: SizeClass,
    /// Lower numbers are preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Supports tool calling.
    #[serde(default)]
    pub tools: bool,
    #[serde(default)]
    pub extended_reasoning: bool,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
}

impl ModelSpec {
    pub fn new(name: &str, category: Category, size: SizeClass, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            category,
            size,
            priority,
            tools: false,
            extended_reasoning: category == Category::Reasoning,
            context_window: default_context_window(),
        }
    }

    pub fn with_tools(mut self) -> Self {
        self.tools = true;
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }
}

/// Built-in catalog of locally served models.
pub fn builtin_catalog() -> Vec<ModelSpec> {
    use Category::*;
    use SizeClass::*;
    vec![
        ModelSpec::new("qwen2.5-coder:32b", Coding, Large, 1).with_tools().with_context_window(32768),
        ModelSpec::new("deepseek-coder-v2:16b", Coding, Medium, 2).with_context_window(32768),
        ModelSpec::new("qwen2.5-coder:14b", Coding, Medium, 1).with_tools().with_context_window(32768),
        ModelSpec::new("qwen2.5-coder:7b", Coding, Small, 1).with_tools().with_context_window(32768),
        ModelSpec::new("deepseek-r1:32b", Reasoning, Large, 1).with_context_window(32768),
        ModelSpec::new("deepseek-r1:14b", Reasoning, Medium, 1).with_context_window(32768),
        ModelSpec::new("deepseek-r1:7b", Reasoning, Small, 2),
        ModelSpec::new("qwen2.5:32b", General, Large, 1).with_tools().with_context_window(32768),
        ModelSpec::new("llama3.1:8b", General, Medium, 2).with_tools().with_context_window(16384),
        ModelSpec::new("qwen3:14b", Agentic, Medium, 1).with_tools().with_context_window(32768),
        ModelSpec::new("llama3.2:3b", Fast, Small, 1).with_tools(),
        ModelSpec::new("phi4-mini", Fast, Small, 2),
        ModelSpec::new("mistral-nemo:12b", Summarizer, Medium, 1).with_context_window(65536),
        ModelSpec::new("nomic-embed-text", Embedding, Small, 1),
    ]
}

/// Names compare with an implicit `:latest` tag.
fn normalize(name: &str) -> String {
    let name = name.trim();
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

/// Where the set of locally available model names comes from.
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    async fn list(&self) -> Result<HashSet<String>>;
}

/// A fixed availability set.
#[derive(Debug, Clone, Default)]
pub struct StaticAvailability {
    names: HashSet<String>,
}

impl StaticAvailability {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl AvailabilitySource for StaticAvailability {
    async fn list(&self) -> Result<HashSet<String>> {
        Ok(self.names.clone())
    }
}

/// Runs a listing command (such as `ollama list`) and takes the first
/// column of every row, skipping a `NAME` header.
#[derive(Debug, Clone)]
pub struct CommandAvailability {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAvailability {
    /// Split a command line on whitespace.
    ///
    /// # Errors
    /// Returns an error if the command line is empty.
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("availability command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    pub fn parse_listing(stdout: &str) -> HashSet<String> {
        stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|first| !first.eq_ignore_ascii_case("name"))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl AvailabilitySource for CommandAvailability {
    async fn list(&self) -> Result<HashSet<String>> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program).args(&self.args).output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(Error::Invocation {
                model: self.program.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Self::parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Model descriptors plus a cached availability set.
pub struct ModelRegistry {
    specs: Vec<ModelSpec>,
    source: Box<dyn AvailabilitySource>,
    /// Normalized names of available models; `None` until first queried.
    available: RwLock<Option<HashSet<String>>>,
}

impl ModelRegistry {
    /// Create a registry. Later specs with an already-seen name replace the
    /// earlier entry, so config entries can override the built-in catalog.
    pub fn new(specs: Vec<ModelSpec>, source: Box<dyn AvailabilitySource>) -> Self {
        let mut merged: Vec<ModelSpec> = Vec::new();
        for spec in specs {
            match merged.iter_mut().find(|s| normalize(&s.name) == normalize(&spec.name)) {
                Some(existing) => *existing = spec,
                None => merged.push(spec),
            }
        }
        Self {
            specs: merged,
            source,
            available: RwLock::new(None),
        }
    }

    /// Registry whose availability is known up front.
    pub fn with_available<I, S>(specs: Vec<ModelSpec>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let registry = Self::new(specs, Box::new(StaticAvailability::new(names.clone())));
        registry.store(names.into_iter().collect());
        registry
    }

    pub fn specs(&self) -> &[ModelSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        let wanted = normalize(name);
        self.specs.iter().find(|s| normalize(&s.name) == wanted)
    }

    /// Populate the availability cache if it is empty.
    pub async fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.refresh().await
    }

    /// Re-query the availability source.
    pub async fn refresh(&self) -> Result<()> {
        let names = self.source.list().await?;
        flog!("Model availability refreshed: {} models listed", names.len());
        self.store(names);
        Ok(())
    }

    /// Drop the availability cache.
    pub fn invalidate(&self) {
        flog_debug!("Model availability cache invalidated");
        *self.available.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn store(&self, names: HashSet<String>) {
        let normalized = names.iter().map(|n| normalize(n)).collect();
        *self.available.write().unwrap_or_else(|e| e.into_inner()) = Some(normalized);
    }

    pub fn is_initialized(&self) -> bool {
        self.available
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.available
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|set| set.contains(&normalize(name)))
            .unwrap_or(false)
    }

    /// Registered specs that are currently available, in registry order.
    ///
    /// Empty (with a warning) if availability was never queried.
    pub fn available(&self) -> Vec<&ModelSpec> {
        let guard = self.available.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(set) => self
                .specs
                .iter()
                .filter(|s| set.contains(&normalize(&s.name)))
                .collect(),
            None => {
                flog_warn!("Model availability queried before init; treating as empty");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("specs", &self.specs.len())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
