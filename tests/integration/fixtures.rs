//! Test fixtures for integration tests.
//!
//! Provides scripted collaborators whose behavior is fixed per artifact
//! path, plus helpers for plans, registries and pipelines.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use foundry::core::Plan;
use foundry::models::{builtin_catalog, ModelRegistry, ModelResolver};
use foundry::orchestration::{
    AnalysisRequest, Analyzer, CheckResult, Coder, Collaborators, Diagnosis, GenerationRequest,
    Generator, PatchRequest, Pipeline, PipelineConfig, PoolConfig, Review, ReviewRequest,
    Reviewer, Verification, Verifier, WorkerPool,
};
use foundry::{Error, Result};

/// Models reported as pulled by the fixture registry.
pub const AVAILABLE: &[&str] = &[
    "qwen2.5-coder:7b",
    "qwen2.5-coder:14b",
    "qwen2.5-coder:32b",
    "deepseek-r1:14b",
    "deepseek-r1:32b",
    "mistral-nemo:12b",
];

/// A temporary project root.
pub struct TestProject {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.path.join(relative)).ok()
    }
}

/// `{A: [], B: [], C: [A], D: [B, C]}` as tasks 1 to 4.
pub fn diamond_plan() -> Plan {
    Plan::new("small script with a helper module")
        .with_task(1, "src/a.py", "module a", &[])
        .with_task(2, "src/b.py", "module b", &[])
        .with_task(3, "src/c.py", "module c, uses a", &[1])
        .with_task(4, "src/d.py", "entry point, uses b and c", &[2, 3])
}

pub fn registry() -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::with_available(
        builtin_catalog(),
        AVAILABLE.iter().copied(),
    ))
}

pub fn resolver() -> ModelResolver {
    ModelResolver::new(registry(), "qwen2.5-coder:7b")
}

/// Generator that writes a header line per task; paths in `failing` error.
#[derive(Default)]
pub struct ScriptedGenerator {
    pub failing: HashSet<PathBuf>,
    pub calls: AtomicUsize,
    /// Cancelled when `cancel_on` is generated.
    pub cancel_on: Option<(PathBuf, Arc<Mutex<Option<CancellationToken>>>)>,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((path, token)) = &self.cancel_on {
            if *path == request.path {
                if let Some(token) = token.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
        }
        if self.failing.contains(&request.path) {
            return Err(Error::Invocation {
                model: request.model.clone(),
                message: "scripted generation failure".into(),
            });
        }
        Ok(format!(
            "# {}\n# deps: {}\nVALUE = {}\n",
            request.path.display(),
            request.dependencies.len(),
            request.task_id
        ))
    }
}

/// Approves everything.
#[derive(Default)]
pub struct ApprovingReviewer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Reviewer for ApprovingReviewer {
    async fn review(&self, _request: &ReviewRequest) -> Result<Review> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Review::approve())
    }
}

/// Fails every artifact whose path is in `failing`.
#[derive(Default)]
pub struct PathVerifier {
    pub failing: HashSet<PathBuf>,
}

#[async_trait]
impl Verifier for PathVerifier {
    async fn verify(&self, path: &Path, content: &str) -> Result<Verification> {
        let mut checks = vec![if content.is_empty() {
            CheckResult::fail("non_empty", "artifact is empty")
        } else {
            CheckResult::pass("non_empty")
        }];
        if self.failing.contains(path) {
            checks.push(CheckResult::fail("scripted", "always fails"));
        }
        Ok(Verification::from_checks(checks))
    }
}

#[derive(Default)]
pub struct ScriptedAnalyzer {
    pub fail: bool,
    pub calls: AtomicUsize,
    pub models: Mutex<Vec<String>>,
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Diagnosis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(request.model.clone());
        if self.fail {
            return Err(Error::Parse("scripted analysis failure".into()));
        }
        Ok(Diagnosis {
            root_cause: request.error.clone(),
            fix_strategy: "rewrite".into(),
            ..Diagnosis::default()
        })
    }
}

/// Appends a marker line per patch.
#[derive(Default)]
pub struct ScriptedCoder {
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Coder for ScriptedCoder {
    async fn patch(&self, request: &PatchRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Invocation {
                model: request.model.clone(),
                message: "scripted patch failure".into(),
            });
        }
        Ok(format!("{}# patched\n", request.content))
    }
}

/// Scripted collaborators plus handles for inspecting their calls.
pub struct Harness {
    pub generator: Arc<ScriptedGenerator>,
    pub reviewer: Arc<ApprovingReviewer>,
    pub verifier: Arc<PathVerifier>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub coder: Arc<ScriptedCoder>,
}

impl Harness {
    /// Verification always fails for the given paths.
    pub fn failing_verification(paths: &[&str]) -> Self {
        Self::with_parts(
            ScriptedGenerator::default(),
            PathVerifier {
                failing: paths.iter().map(PathBuf::from).collect(),
            },
        )
    }

    pub fn with_parts(generator: ScriptedGenerator, verifier: PathVerifier) -> Self {
        Self {
            generator: Arc::new(generator),
            reviewer: Arc::new(ApprovingReviewer::default()),
            verifier: Arc::new(verifier),
            analyzer: Arc::new(ScriptedAnalyzer::default()),
            coder: Arc::new(ScriptedCoder::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            generator: self.generator.clone(),
            reviewer: self.reviewer.clone(),
            verifier: self.verifier.clone(),
            analyzer: self.analyzer.clone(),
            coder: self.coder.clone(),
        }
    }

    pub fn pipeline(&self, root: &Path, config: PipelineConfig) -> Pipeline {
        let pool = WorkerPool::new(PoolConfig::with_capacity(4));
        Pipeline::new(config, pool, resolver(), self.collaborators(), root)
    }
}
