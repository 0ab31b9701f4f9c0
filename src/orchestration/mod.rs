//! Orchestration layer for foundry builds.
//!
//! This module provides the worker pool that runs model jobs under an
//! adaptive admission limit, the collaborator interfaces and their
//! model-backed implementations, and the pipeline that sequences a build
//! through generate, review, verify and fix rounds.

mod agents;
mod collaborators;
mod invoker;
mod pipeline;
mod pool;
mod utilization;

pub use agents::{
    extract_code, extract_json, ModelAnalyzer, ModelClassifier, ModelCoder, ModelGenerator,
    ModelReviewer, StaticVerifier, VerifierConfig,
};
pub use collaborators::{
    AnalysisRequest, Analyzer, CheckResult, Coder, DependencyArtifact, Diagnosis,
    GenerationRequest, Generator, InvokeOptions, Message, MessageRole, ModelInvoker, PatchRequest,
    Review, ReviewRequest, Reviewer, Severity, Verification, Verifier,
};
pub use invoker::{CommandInvoker, InvokerConfig, DEFAULT_TIMEOUT_SECS};
pub use pipeline::{
    BuildSummary, Collaborators, Phase, Pipeline, PipelineConfig, PipelineEvent, ProgressSnapshot,
};
pub use pool::{
    adjust, FailureKind, JobError, JobHandle, PoolConfig, PoolEvent, WorkerPool, WorkerResult,
};
pub use utilization::{FixedUtilization, ScriptedUtilization, SystemCpu, UtilizationSource};
