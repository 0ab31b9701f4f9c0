//! Model-backed collaborators and the local verifier.
//!
//! Each agent frames a short prompt for its role and hands it to a
//! `ModelInvoker`. Reviewers and analyzers expect a JSON object somewhere
//! in the reply; surrounding prose and code fences are tolerated.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::models::{Classification, Role, SemanticClassifier};
use crate::orchestration::collaborators::{
    AnalysisRequest, Analyzer, CheckResult, Coder, DependencyArtifact, Diagnosis,
    GenerationRequest, Generator, InvokeOptions, Message, ModelInvoker, PatchRequest, Review,
    ReviewRequest, Reviewer, Verification, Verifier,
};
use crate::{flog_debug, flog_warn};

/// Take the body of the first fenced code block, or the whole reply.
pub fn extract_code(reply: &str) -> String {
    let mut lines = reply.lines();
    while let Some(line) = lines.next() {
        if line.trim_start().starts_with("```") {
            let body: Vec<&str> = lines
                .by_ref()
                .take_while(|l| !l.trim_start().starts_with("```"))
                .collect();
            let mut code = body.join("\n");
            code.push('\n');
            return code;
        }
    }
    let mut code = reply.trim().to_string();
    code.push('\n');
    code
}

/// Parse the outermost `{ ... }` in a reply.
pub fn extract_json<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let start = reply
        .find('{')
        .ok_or_else(|| Error::Parse("no JSON object in reply".into()))?;
    let end = reply
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| Error::Parse("unterminated JSON object in reply".into()))?;
    serde_json::from_str(&reply[start..=end]).map_err(|e| Error::Parse(e.to_string()))
}

fn dependency_context(dependencies: &[DependencyArtifact]) -> String {
    if dependencies.is_empty() {
        return String::new();
    }
    let mut context = String::from("\n\nFiles this one depends on:\n");
    for dep in dependencies {
        context.push_str(&format!(
            "\n--- {} ---\n{}\n",
            dep.path.display(),
            dep.content.trim_end()
        ));
    }
    context
}

pub struct ModelGenerator {
    invoker: Arc<dyn ModelInvoker>,
    options: InvokeOptions,
}

impl ModelGenerator {
    pub fn new(invoker: Arc<dyn ModelInvoker>, options: InvokeOptions) -> Self {
        Self { invoker, options }
    }
}

#[async_trait]
impl Generator for ModelGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let messages = vec![
            Message::system(
                "You are a careful software engineer. Reply with the complete \
                 contents of the requested file in a single fenced code block.",
            ),
            Message::user(format!(
                "Project: {}\n\nWrite `{}`: {}{}",
                request.plan_summary,
                request.path.display(),
                request.description,
                dependency_context(&request.dependencies)
            )),
        ];
        let reply = self
            .invoker
            .invoke(&request.model, Role::Generator, &messages, &self.options)
            .await?;
        Ok(extract_code(&reply))
    }
}

pub struct ModelReviewer {
    invoker: Arc<dyn ModelInvoker>,
    options: InvokeOptions,
}

impl ModelReviewer {
    pub fn new(invoker: Arc<dyn ModelInvoker>, options: InvokeOptions) -> Self {
        Self { invoker, options }
    }
}

#[async_trait]
impl Reviewer for ModelReviewer {
    async fn review(&self, request: &ReviewRequest) -> Result<Review> {
        let messages = vec![
            Message::system(
                "You review code for correctness against its description. Reply \
                 with JSON: {\"approved\": bool, \"issues\": [string], \"summary\": string}.",
            ),
            Message::user(format!(
                "File `{}` should: {}\n\n```\n{}\n```",
                request.path.display(),
                request.description,
                request.content.trim_end()
            )),
        ];
        let reply = self
            .invoker
            .invoke(&request.model, Role::Reviewer, &messages, &self.options)
            .await?;
        extract_json(&reply)
    }
}

pub struct ModelAnalyzer {
    invoker: Arc<dyn ModelInvoker>,
    options: InvokeOptions,
}

impl ModelAnalyzer {
    pub fn new(invoker: Arc<dyn ModelInvoker>, options: InvokeOptions) -> Self {
        Self { invoker, options }
    }
}

#[async_trait]
impl Analyzer for ModelAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Diagnosis> {
        let messages = vec![
            Message::system(
                "You diagnose failing code. Reply with JSON: {\"root_cause\": string, \
                 \"fix_strategy\": string, \"severity\": \"low\"|\"medium\"|\"high\", \
                 \"is_dependency_issue\": bool}.",
            ),
            Message::user(format!(
                "File `{}` ({}) failed {} time(s) with:\n{}\n\n```\n{}\n```{}",
                request.path.display(),
                request.description,
                request.failures,
                request.error,
                request.content.trim_end(),
                dependency_context(&request.dependencies)
            )),
        ];
        let reply = self
            .invoker
            .invoke(&request.model, Role::Analyzer, &messages, &self.options)
            .await?;
        extract_json(&reply)
    }
}

pub struct ModelCoder {
    invoker: Arc<dyn ModelInvoker>,
    options: InvokeOptions,
}

impl ModelCoder {
    pub fn new(invoker: Arc<dyn ModelInvoker>, options: InvokeOptions) -> Self {
        Self { invoker, options }
    }
}

#[async_trait]
impl Coder for ModelCoder {
    async fn patch(&self, request: &PatchRequest) -> Result<String> {
        let messages = vec![
            Message::system(
                "You fix code. Reply with the complete corrected file in a single \
                 fenced code block.",
            ),
            Message::user(format!(
                "File `{}` should: {}\n\nProblem:\n{}\n\nDiagnosis: {}\nStrategy: {}\n\n```\n{}\n```{}",
                request.path.display(),
                request.description,
                request.error,
                request.diagnosis.root_cause,
                request.diagnosis.fix_strategy,
                request.content.trim_end(),
                dependency_context(&request.dependencies)
            )),
        ];
        let reply = self
            .invoker
            .invoke(&request.model, Role::Coder, &messages, &self.options)
            .await?;
        Ok(extract_code(&reply))
    }
}

/// Second-opinion classifier backed by a small model.
pub struct ModelClassifier {
    invoker: Arc<dyn ModelInvoker>,
    model: String,
}

impl ModelClassifier {
    /// Role the classifier's model is resolved and invoked under.
    pub const ROLE: Role = Role::Summarizer;

    pub fn new(invoker: Arc<dyn ModelInvoker>, model: &str) -> Self {
        Self {
            invoker,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl SemanticClassifier for ModelClassifier {
    async fn classify(&self, text: &str) -> Option<Classification> {
        let messages = vec![
            Message::system(
                "Classify a software project. Reply with JSON: {\"complexity\": \
                 \"simple\"|\"medium\"|\"heavy\", \"size\": \"small\"|\"medium\"|\"large\"}.",
            ),
            Message::user(text.to_string()),
        ];
        let reply = self
            .invoker
            .invoke(&self.model, Self::ROLE, &messages, &InvokeOptions::default())
            .await;
        match reply.and_then(|r| extract_json::<Classification>(&r)) {
            Ok(classification) => Some(classification),
            Err(e) => {
                flog_warn!("Semantic classification failed: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Extension (without the dot) to a check command; `{path}` is replaced
    /// by the artifact's absolute path.
    pub commands: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
            timeout_secs: 60,
        }
    }
}

const HASH_COMMENT_EXTS: &[&str] = &["py", "sh", "rb", "toml", "yaml", "yml", "r", "pl"];
const SLASH_COMMENT_EXTS: &[&str] = &[
    "rs", "js", "jsx", "ts", "tsx", "c", "h", "cc", "cpp", "hpp", "java", "go", "kt", "swift",
    "cs", "scala", "json",
];

/// Local checks on an artifact plus an optional per-extension command.
#[derive(Debug, Clone)]
pub struct StaticVerifier {
    root: PathBuf,
    config: VerifierConfig,
}

impl StaticVerifier {
    pub fn new(root: &Path, config: VerifierConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    fn extension(path: &Path) -> String {
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default()
    }

    fn check_non_empty(content: &str) -> CheckResult {
        if content.trim().is_empty() {
            CheckResult::fail("non_empty", "artifact is empty")
        } else {
            CheckResult::pass("non_empty")
        }
    }

    fn check_markers(content: &str, ext: &str) -> CheckResult {
        // a lone `=======` is a heading underline; real conflicts carry the outer markers
        for (n, line) in content.lines().enumerate() {
            let conflict = line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>");
            if conflict {
                return CheckResult::fail("no_markers", format!("conflict marker on line {}", n + 1));
            }
            if ext != "md" && line.trim_start().starts_with("```") {
                return CheckResult::fail("no_markers", format!("code fence on line {}", n + 1));
            }
        }
        CheckResult::pass("no_markers")
    }

    /// Bracket balance outside strings, character literals and comments.
    fn check_delimiters(content: &str, ext: &str) -> Option<CheckResult> {
        let syntax = if HASH_COMMENT_EXTS.contains(&ext) {
            Syntax::Hash
        } else if SLASH_COMMENT_EXTS.contains(&ext) {
            Syntax::Slash { rust: ext == "rs" }
        } else {
            return None;
        };
        Some(match unbalanced_delimiter(content, syntax) {
            Some(problem) => CheckResult::fail("balanced_delimiters", problem),
            None => CheckResult::pass("balanced_delimiters"),
        })
    }

    async fn check_command(&self, path: &Path, ext: &str) -> Option<CheckResult> {
        let template = self.config.commands.get(ext)?;
        let absolute = self.root.join(path);
        let mut parts = template
            .split_whitespace()
            .map(|part| part.replace("{path}", &absolute.display().to_string()));
        let program = parts.next()?;
        let args: Vec<String> = parts.collect();

        if which::which(&program).is_err() {
            flog_warn!("Verifier command {} not found; skipping", program);
            return None;
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = tokio::time::timeout(
            timeout,
            Command::new(&program)
                .args(&args)
                .current_dir(&self.root)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        Some(match output {
            Ok(Ok(out)) if out.status.success() => CheckResult::pass("command"),
            Ok(Ok(out)) => {
                let mut detail = String::from_utf8_lossy(&out.stderr).trim().to_string();
                if detail.is_empty() {
                    detail = String::from_utf8_lossy(&out.stdout).trim().to_string();
                }
                CheckResult::fail("command", detail)
            }
            Ok(Err(e)) => CheckResult::fail("command", e.to_string()),
            Err(_) => CheckResult::fail("command", format!("timed out after {:?}", timeout)),
        })
    }
}

#[async_trait]
impl Verifier for StaticVerifier {
    async fn verify(&self, path: &Path, content: &str) -> Result<Verification> {
        let ext = Self::extension(path);
        let mut checks = vec![
            Self::check_non_empty(content),
            Self::check_markers(content, &ext),
        ];
        checks.extend(Self::check_delimiters(content, &ext));
        checks.extend(self.check_command(path, &ext).await);

        let verification = Verification::from_checks(checks);
        flog_debug!(
            "verify {}: {}",
            path.display(),
            if verification.passed { "pass" } else { "fail" }
        );
        Ok(verification)
    }
}

/// Comment and quoting rules for the delimiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    /// `#` comments; single, double and triple-quoted strings.
    Hash,
    /// `//` and `/* */` comments; in Rust a single quote may start a lifetime.
    Slash { rust: bool },
}

fn closer_of(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// First bracket problem in `content`, if any.
fn unbalanced_delimiter(content: &str, syntax: Syntax) -> Option<String> {
    let chars: Vec<char> = content.chars().collect();
    let at = |i: usize| chars.get(i).copied();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '\n' => line += 1,
            // `$#` and `${#var}` in shell are not comments
            '#' if syntax == Syntax::Hash && (i == 0 || !matches!(chars[i - 1], '$' | '{')) => {
                while at(i + 1).is_some_and(|c| c != '\n') {
                    i += 1;
                }
            }
            '/' if syntax != Syntax::Hash && at(i + 1) == Some('/') => {
                while at(i + 1).is_some_and(|c| c != '\n') {
                    i += 1;
                }
            }
            '/' if syntax != Syntax::Hash && at(i + 1) == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && at(i + 1) == Some('/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            '\'' if syntax == (Syntax::Slash { rust: true }) => {
                // 'x' and '\n' are literals; anything else is a lifetime
                if at(i + 1) == Some('\\') {
                    i += 2;
                    while at(i + 1).is_some_and(|c| c != '\'' && c != '\n') {
                        i += 1;
                    }
                    i += 1;
                } else if at(i + 2) == Some('\'') {
                    i += 2;
                }
            }
            '"' | '\'' | '`' => {
                let triple =
                    syntax == Syntax::Hash && at(i + 1) == Some(ch) && at(i + 2) == Some(ch);
                // hash-language strings end with the line unless triple-quoted
                let multiline = triple || syntax != Syntax::Hash;
                i += if triple { 3 } else { 1 };
                while i < chars.len() {
                    let c = chars[i];
                    if c == '\\' {
                        if at(i + 1) == Some('\n') {
                            line += 1;
                        }
                        i += 2;
                        continue;
                    }
                    if c == '\n' {
                        if !multiline {
                            break;
                        }
                        line += 1;
                    }
                    if c == ch && (!triple || (at(i + 1) == Some(ch) && at(i + 2) == Some(ch))) {
                        i += if triple { 2 } else { 0 };
                        break;
                    }
                    i += 1;
                }
                if at(i) == Some('\n') {
                    continue;
                }
            }
            '(' | '[' | '{' => stack.push((ch, line)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _)) if closer_of(open) == ch => {}
                Some((open, from)) => {
                    return Some(format!(
                        "'{}' on line {} closes '{}' from line {}",
                        ch, line, open, from
                    ))
                }
                None => return Some(format!("unmatched '{}' on line {}", ch, line)),
            },
            _ => {}
        }
        i += 1;
    }

    stack
        .last()
        .map(|(open, from)| format!("unclosed '{}' from line {}", open, from))
}
