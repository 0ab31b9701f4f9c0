//! Command-line model invoker.
//!
//! `CommandInvoker` runs a configured command (by default `ollama run
//! {model}`) with the rendered conversation on stdin and returns stdout as
//! the model's reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::models::Role;
use crate::orchestration::collaborators::{InvokeOptions, Message, MessageRole, ModelInvoker};
use crate::{flog_debug, flog_trace};

/// Default timeout for one invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    /// Command line; `{model}`, `{context_window}` and `{temperature}` are
    /// substituted per call.
    pub command: String,
    pub timeout_secs: u64,
    /// Command whose first output column lists locally available models.
    pub availability_command: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            command: "ollama run {model}".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            availability_command: "ollama list".to_string(),
        }
    }
}

impl InvokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Runs a model through an external command.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandInvoker {
    /// Build an invoker from config, resolving the program with `which`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command line is empty or the program cannot
    /// be found.
    pub fn new(config: &InvokerConfig) -> Result<Self> {
        let mut parts = config.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("invoker.command is empty".into()))?;
        let binary = which::which(program).map_err(|_| Error::Invocation {
            model: program.to_string(),
            message: "binary not found on PATH".to_string(),
        })?;
        Ok(Self {
            binary,
            args: parts.map(str::to_string).collect(),
            timeout: config.timeout(),
        })
    }

    /// Invoker for a specific binary, bypassing the PATH lookup.
    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self {
            binary,
            args,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn render_args(&self, model: &str, options: &InvokeOptions) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", model)
                    .replace("{context_window}", &options.context_window.to_string())
                    .replace("{temperature}", &options.temperature.to_string())
            })
            .collect()
    }

    /// Flatten a conversation into a single prompt.
    pub fn render_prompt(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| {
                let heading = match m.role {
                    MessageRole::System => "### System",
                    MessageRole::User => "### User",
                    MessageRole::Assistant => "### Assistant",
                };
                format!("{}\n{}", heading, m.content.trim())
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
impl ModelInvoker for CommandInvoker {
    async fn invoke(
        &self,
        model: &str,
        role: Role,
        messages: &[Message],
        options: &InvokeOptions,
    ) -> Result<String> {
        let args = self.render_args(model, options);
        let prompt = Self::render_prompt(messages);
        flog_debug!(
            "invoke {} as {} ({} chars, timeout {:?})",
            model,
            role,
            prompt.len(),
            self.timeout
        );

        let run = async {
            let mut child = Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes()).await?;
                // closing stdin ends the prompt
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "command exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Invocation {
                model: model.to_string(),
                message,
            });
        }

        let reply = stdout.trim();
        if reply.is_empty() {
            return Err(Error::Invocation {
                model: model.to_string(),
                message: "empty response".to_string(),
            });
        }
        flog_trace!("{} replied with {} chars", model, reply.len());
        Ok(reply.to_string())
    }
}
