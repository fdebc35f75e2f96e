//! External agent CLI - one subprocess per prompt.
//!
//! Each invocation spawns the agent in its own process group, waits up to a
//! timeout and reports the exit status. The agent delivers its answer to
//! Telegram by itself, so stdout is only kept for debugging and stderr only
//! for the logs.
//!
//! The process group is killed whenever an invocation ends, including when its
//! future is dropped on shutdown, so helpers the agent started (shells,
//! scripts) never outlive it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::AgentSettings;

/// Marker prepended to prompts fired by the scheduler.
pub const SCHEDULED_MARKER: &str = "[Automated run triggered by scheduler]";

/// Max bytes of stderr kept for logging.
const MAX_STDERR_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for agent: {0}")]
    Wait(#[from] std::io::Error),
}

/// How a completed invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Success,
    Failure { code: Option<i32>, stderr: String },
    Timeout,
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn invoke(&self, prompt: &str, cwd: &Path, timeout: Duration) -> Result<AgentOutcome, AgentError>;
}

/// Runs the configured agent command.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    program: String,
    subcommand: Vec<String>,
    model: Option<String>,
}

impl AgentInvoker {
    pub fn new(program: impl Into<String>, subcommand: Vec<String>, model: Option<String>) -> Self {
        Self {
            program: program.into(),
            subcommand,
            model,
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.command.clone(), settings.subcommand.clone(), settings.model.clone())
    }

    /// Full argument list for `prompt`, without the program.
    pub fn args(&self, prompt: &str) -> Vec<String> {
        let mut args = self.subcommand.clone();
        args.push(prompt.to_string());
        if let Some(model) = &self.model {
            args.push("-m".to_string());
            args.push(model.clone());
        }
        args
    }
}

#[async_trait]
impl AgentRunner for AgentInvoker {
    async fn invoke(&self, prompt: &str, cwd: &Path, timeout: Duration) -> Result<AgentOutcome, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(prompt))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| AgentError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        let _group = GroupKill(pid);
        info!("🚀 Agent started (PID {:?}, timeout {:?})", pid, timeout);

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                debug!("Agent stdout: {} bytes", output.stdout.len());
                if output.status.success() {
                    info!("✅ Agent finished");
                    Ok(AgentOutcome::Success)
                } else {
                    let stderr = truncate_stderr(&output.stderr);
                    error!("Agent exited with {:?}: {}", output.status.code(), stderr);
                    Ok(AgentOutcome::Failure {
                        code: output.status.code(),
                        stderr,
                    })
                }
            }
            Ok(Err(e)) => Err(AgentError::Wait(e)),
            Err(_) => {
                warn!("⏱️ Agent timed out after {:?}, killing process group", timeout);
                Ok(AgentOutcome::Timeout)
            }
        }
    }
}

/// SIGKILLs the agent's process group on drop.
struct GroupKill(Option<u32>);

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            kill_process_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: plain syscall on a group id we created via process_group(0).
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if rc != 0 {
        debug!("Process group {} already gone", pid);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn truncate_stderr(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.len() <= MAX_STDERR_BYTES {
        return text.to_string();
    }
    let mut end = MAX_STDERR_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &text[..end])
}

/// Prompt for a scheduled (or manually triggered) job.
pub fn scheduled_prompt(content: &str) -> String {
    format!("{SCHEDULED_MARKER}\n\n{content}")
}

/// Run a job's content through the agent with the scheduled timeout.
/// Returns whether the agent succeeded; failures are logged, not propagated.
pub async fn run_scheduled(runner: &dyn AgentRunner, content: &str, cwd: &Path, timeout: Duration) -> bool {
    let preview: String = content.chars().take(100).collect();
    info!("⏰ Scheduled run: \"{}\"", preview);

    match runner.invoke(&scheduled_prompt(content), cwd, timeout).await {
        Ok(AgentOutcome::Success) => true,
        Ok(AgentOutcome::Failure { code, .. }) => {
            warn!("Scheduled run failed (exit {:?})", code);
            false
        }
        Ok(AgentOutcome::Timeout) => {
            warn!("Scheduled run timed out");
            false
        }
        Err(e) => {
            error!("Scheduled run could not start: {}", e);
            false
        }
    }
}

/// Where and how long the agent runs; shared by the router and the scheduler.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub workdir: PathBuf,
    pub interactive_timeout: Duration,
    pub scheduled_timeout: Duration,
    pub skill: String,
}

impl AgentContext {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            workdir: settings.workdir.clone(),
            interactive_timeout: settings.interactive_timeout,
            scheduled_timeout: settings.scheduled_timeout,
            skill: settings.skill.clone(),
        }
    }
}
