//! Interfaces to the components that do the actual work for a task.
//!
//! The pipeline only sequences phases; generation, review, verification,
//! diagnosis and patching are delegated to these traits so the engine can
//! run against live models or scripted test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::task::TaskId;
use crate::error::Result;
use crate::models::Role;

/// An artifact a task depends on, handed to jobs by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyArtifact {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub description: String,
    pub plan_summary: String,
    pub model: String,
    pub dependencies: Vec<DependencyArtifact>,
}

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub description: String,
    pub content: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Review {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl Review {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Self::default()
        }
    }

    pub fn reject(issues: Vec<String>) -> Self {
        Self {
            approved: false,
            summary: issues.join("; "),
            issues,
        }
    }

    /// Feedback text recorded on a rejected task.
    pub fn feedback(&self) -> String {
        if self.issues.is_empty() {
            self.summary.clone()
        } else {
            self.issues.join("\n")
        }
    }
}

/// One local check run by a verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: String::new(),
        }
    }

    pub fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

impl Verification {
    /// Passed iff every check passed.
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        Self {
            passed: checks.iter().all(|c| c.passed),
            checks,
        }
    }

    /// `name: detail` for every failing check, one per line.
    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| {
                if c.detail.is_empty() {
                    c.name.clone()
                } else {
                    format!("{}: {}", c.name, c.detail)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub description: String,
    pub content: String,
    pub error: String,
    pub failures: u32,
    pub model: String,
    pub dependencies: Vec<DependencyArtifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub fix_strategy: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub is_dependency_issue: bool,
}

#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub description: String,
    pub content: String,
    pub error: String,
    pub diagnosis: Diagnosis,
    pub model: String,
    pub dependencies: Vec<DependencyArtifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeOptions {
    pub context_window: u32,
    pub temperature: f32,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            context_window: 8192,
            temperature: 0.2,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce the full artifact content.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> Result<Review>;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, path: &Path, content: &str) -> Result<Verification>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Diagnosis>;
}

#[async_trait]
pub trait Coder: Send + Sync {
    /// Produce the full patched artifact content.
    async fn patch(&self, request: &PatchRequest) -> Result<String>;
}

/// Sends a conversation to a named model and returns its reply.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        model: &str,
        role: Role,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<String>;
}
