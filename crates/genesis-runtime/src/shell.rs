//! Shell Tools
//!
//! `shell` runs a command to completion under a timeout, or detaches it
//! into the [`JobManager`] when it looks like a long-lived service.
//! `job_status` polls detached jobs.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genesis_core::{
    error::{AgentError, Result},
    tool::Tool,
};
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, info};

use crate::jobs::JobManager;

pub const SHELL_TOOL: &str = "shell";
pub const JOB_STATUS_TOOL: &str = "job_status";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_OUTPUT_CHARS: usize = 10_000;

const DANGEROUS_PATTERNS: &[&str] = &["rm -rf /", "dd if=", "mkfs", ":(){:|:&};:"];
const SERVICE_WORDS: &[&str] = &["serve", "server", "runserver", "daemon", "watch"];
const SERVICE_PHRASES: &[&str] = &["tail -f", "npm start", "http.server"];

/// Heuristic for commands that never exit on their own
pub fn looks_like_service(command: &str) -> bool {
    let trimmed = command.trim_end();
    if trimmed.ends_with('&') && !trimmed.ends_with("&&") {
        return true;
    }
    if SERVICE_PHRASES.iter().any(|p| command.contains(p)) {
        return true;
    }
    command
        .split(|c: char| c.is_whitespace() || matches!(c, '/' | ';' | '|' | '&'))
        .any(|word| SERVICE_WORDS.contains(&word))
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{head}\n... [output truncated]")
}

/// Runs shell commands on the host
pub struct ShellTool {
    jobs: Arc<JobManager>,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs, timeout: DEFAULT_TIMEOUT }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_foreground(&self, command: &str, cwd: Option<&PathBuf>) -> Result<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| AgentError::ToolExecution(format!("failed to run command: {e}")))?,
            Err(_) => {
                return Err(AgentError::ToolExecution(format!(
                    "command timed out after {:?} and was killed; pass background=true for long-running services",
                    self.timeout
                )));
            }
        };

        let code = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(command, exit_code = ?code, "shell command finished");

        let mut text = format!("Command: {command}\n");
        if let Some(dir) = cwd {
            text.push_str(&format!("Directory: {}\n", dir.display()));
        }
        match code {
            Some(code) => text.push_str(&format!("Exit code: {code}\n")),
            None => text.push_str("Exit code: none (terminated by signal)\n"),
        }
        if !stdout.is_empty() {
            text.push_str(&format!("\n[STDOUT]:\n{}", truncate(&stdout)));
        }
        if !stderr.is_empty() {
            text.push_str(&format!("\n[STDERR]:\n{}", truncate(&stderr)));
        }
        Ok(text)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        SHELL_TOOL
    }

    fn description(&self) -> &str {
        "Run a shell command on the host and return its exit code and output. \
         Long-running services (servers, watchers, daemons) are started as \
         background jobs; check them with job_status."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Command line passed to sh -c" },
                "cwd": { "type": "string", "description": "Working directory" },
                "background": {
                    "type": "boolean",
                    "description": "Start as a background job instead of waiting",
                    "default": false
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AgentError::ToolValidation("command must be a non-empty string".into()))?;

        if DANGEROUS_PATTERNS.iter().any(|p| command.contains(p)) {
            return Err(AgentError::ToolValidation(format!("refusing dangerous command: {command}")));
        }

        let cwd = args.get("cwd").and_then(Value::as_str).map(PathBuf::from);
        if let Some(dir) = &cwd {
            if !dir.is_dir() {
                return Err(AgentError::ToolValidation(format!(
                    "working directory not found: {}",
                    dir.display()
                )));
            }
        }

        let background = args.get("background").and_then(Value::as_bool).unwrap_or(false);
        if background || looks_like_service(command) {
            let id = self.jobs.spawn(command, cwd.as_deref()).await?;
            info!(job_id = %id, command, explicit = background, "Detached long-running command");
            return Ok(format!(
                "Job started. ID: {id}\nUse {JOB_STATUS_TOOL} with job_id=\"{id}\" to monitor."
            ));
        }

        self.run_foreground(command, cwd.as_ref()).await
    }
}

/// Reports on background jobs
pub struct JobStatusTool {
    jobs: Arc<JobManager>,
}

impl JobStatusTool {
    pub const fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Tool for JobStatusTool {
    fn name(&self) -> &str {
        JOB_STATUS_TOOL
    }

    fn description(&self) -> &str {
        "Check a background job's status and new output. Without job_id, list active jobs."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": { "type": "string", "description": "Job ID returned by shell" }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<String> {
        if let Some(id) = args.get("job_id").and_then(Value::as_str) {
            return Ok(self.jobs.poll(id).await?.to_string());
        }

        let active = self.jobs.list(true).await;
        if active.is_empty() {
            return Ok("No active jobs.".into());
        }
        let mut lines = vec!["Active jobs:".to_string()];
        lines.extend(
            active
                .iter()
                .map(|j| format!("- {}: {} [{}]", j.id, j.command, j.status)),
        );
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_core::tool::ToolRegistry;

    fn tools() -> (ShellTool, JobStatusTool) {
        let jobs = Arc::new(JobManager::new());
        (ShellTool::new(Arc::clone(&jobs)), JobStatusTool::new(jobs))
    }

    #[test]
    fn test_service_detection() {
        assert!(looks_like_service("python -m http.server 8000"));
        assert!(looks_like_service("npm start"));
        assert!(looks_like_service("tail -f /var/log/syslog"));
        assert!(looks_like_service("./run.sh &"));
        assert!(looks_like_service("npm run serve"));
        assert!(looks_like_service("cargo watch -x test"));
        assert!(!looks_like_service("make && make install"));
        assert!(!looks_like_service("cat /etc/observer.conf"));
        assert!(!looks_like_service("ls -la"));
    }

    #[tokio::test]
    async fn test_foreground_command() {
        let (shell, _) = tools();
        let out = shell.execute(json!({"command": "echo hello; echo warn >&2"})).await.unwrap();
        assert!(out.contains("Exit code: 0"));
        assert!(out.contains("[STDOUT]:\nhello"));
        assert!(out.contains("[STDERR]:\nwarn"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_raised() {
        let (shell, _) = tools();
        let out = shell.execute(json!({"command": "exit 4"})).await.unwrap();
        assert!(out.contains("Exit code: 4"));
    }

    #[tokio::test]
    async fn test_timeout_kills_foreground_command() {
        let (shell, _) = tools();
        let shell = shell.with_timeout(Duration::from_millis(200));
        let err = shell.execute(json!({"command": "sleep 5"})).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_background_job_round_trip() {
        let (shell, status) = tools();
        let out = shell
            .execute(json!({"command": "echo started", "background": true}))
            .await
            .unwrap();
        let id = out
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("Job started. ID: "))
            .unwrap()
            .to_string();

        let mut report = String::new();
        for _ in 0..50 {
            report = status.execute(json!({"job_id": id})).await.unwrap();
            if report.contains("COMPLETED") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(report.contains("Status: COMPLETED (Exit: 0)"));
        assert!(report.contains("started"));
        assert_eq!(status.execute(json!({})).await.unwrap(), "No active jobs.");
    }

    #[tokio::test]
    async fn test_rejections_surface_as_error_text() {
        let (shell, status) = tools();
        let mut registry = ToolRegistry::new();
        registry.register(shell);
        registry.register(status);

        let out = registry.execute(SHELL_TOOL, json!({"command": "rm -rf / --no-preserve-root"})).await;
        assert!(out.starts_with("Error:"));
        let out = registry.execute(SHELL_TOOL, json!({"command": "ls", "cwd": "/no/such/dir"})).await;
        assert!(out.starts_with("Error:"));
        let out = registry.execute(JOB_STATUS_TOOL, json!({"job_id": "job_nope"})).await;
        assert!(out.starts_with("Error:"));
    }
}
