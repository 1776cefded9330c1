//! Background Jobs
//!
//! Long-running shell commands detached from the reasoning loop. Each job
//! has reader tasks pushing output into a channel and a waiter task that
//! reports the exit; callers drain the channel when they poll.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use genesis_core::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// Grace period for readers to flush after the process exits
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl JobStatus {
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        })
    }
}

/// Snapshot of one job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// Result of [`JobManager::poll`]: status plus output since the last poll
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPoll {
    pub id: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub new_stdout: String,
    pub new_stderr: String,
}

impl std::fmt::Display for JobPoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job ID: {}\nStatus: {}", self.id, self.status)?;
        if let Some(code) = self.exit_code {
            write!(f, " (Exit: {code})")?;
        }
        if !self.new_stdout.is_empty() {
            write!(f, "\n[STDOUT]:\n{}", self.new_stdout)?;
        }
        if !self.new_stderr.is_empty() {
            write!(f, "\n[STDERR]:\n{}", self.new_stderr)?;
        }
        Ok(())
    }
}

enum JobEvent {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
    Killed,
}

struct JobEntry {
    info: JobInfo,
    events: mpsc::UnboundedReceiver<JobEvent>,
    kill: Option<oneshot::Sender<()>>,
    /// Output received but not yet returned by `poll`
    pending_stdout: String,
    pending_stderr: String,
}

impl JobEntry {
    /// Apply queued events to status and pending output
    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                JobEvent::Stdout(line) => self.pending_stdout.push_str(&line),
                JobEvent::Stderr(line) => self.pending_stderr.push_str(&line),
                JobEvent::Exited(code) => {
                    self.info.exit_code = code;
                    self.info.status = if code == Some(0) {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    info!(job_id = %self.info.id, exit_code = ?code, "Job finished");
                }
                JobEvent::Killed => self.info.status = JobStatus::Terminated,
            }
        }
    }
}

fn pipe_lines<R>(reader: R, tx: mpsc::UnboundedSender<JobEvent>, wrap: fn(String) -> JobEvent) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(wrap(format!("{line}\n"))).is_err() {
                break;
            }
        }
    })
}

/// Registry of background processes
#[derive(Default)]
pub struct JobManager {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager").finish_non_exhaustive()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `command` under `sh -c` and return its job id
    pub async fn spawn(&self, command: &str, cwd: Option<&Path>) -> Result<String> {
        let cwd = match cwd {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir()?,
        };
        if !cwd.is_dir() {
            return Err(AgentError::ToolExecution(format!(
                "working directory not found: {}",
                cwd.display()
            )));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::ToolExecution(format!("failed to spawn job: {e}")))?;

        let id = format!("job_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let pid = child.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(pipe_lines(out, tx.clone(), JobEvent::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(pipe_lines(err, tx.clone(), JobEvent::Stderr));
        }

        let job_id = id.clone();
        tokio::spawn(async move {
            let event = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => JobEvent::Exited(status.code()),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Job wait failed");
                        JobEvent::Exited(None)
                    }
                },
                Ok(()) = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job_id, error = %e, "Job kill failed");
                    }
                    JobEvent::Killed
                }
            };
            let _ = tokio::time::timeout(DRAIN_GRACE, join_readers(readers)).await;
            let _ = tx.send(event);
        });

        info!(job_id = %id, command, cwd = %cwd.display(), "Job spawned");
        self.jobs.lock().await.insert(
            id.clone(),
            JobEntry {
                info: JobInfo {
                    id: id.clone(),
                    command: command.to_string(),
                    cwd,
                    pid,
                    status: JobStatus::Running,
                    started_at: Utc::now(),
                    exit_code: None,
                },
                events: rx,
                kill: Some(kill_tx),
                pending_stdout: String::new(),
                pending_stderr: String::new(),
            },
        );
        Ok(id)
    }

    /// Current status and output produced since the previous poll
    pub async fn poll(&self, id: &str) -> Result<JobPoll> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| AgentError::ToolExecution(format!("job not found: {id}")))?;
        job.drain();
        Ok(JobPoll {
            id: job.info.id.clone(),
            status: job.info.status,
            exit_code: job.info.exit_code,
            new_stdout: std::mem::take(&mut job.pending_stdout),
            new_stderr: std::mem::take(&mut job.pending_stderr),
        })
    }

    /// Jobs sorted by start time, refreshing each status first
    pub async fn list(&self, active_only: bool) -> Vec<JobInfo> {
        let mut jobs = self.jobs.lock().await;
        let mut infos: Vec<JobInfo> = jobs
            .values_mut()
            .map(|job| {
                job.drain();
                job.info.clone()
            })
            .filter(|info| !active_only || info.status.is_active())
            .collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    /// Ask a running job to stop; `false` if it was not running
    pub async fn kill(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(id) else {
            return false;
        };
        job.drain();
        match job.kill.take() {
            Some(tx) if job.info.status.is_active() => tx.send(()).is_ok(),
            _ => false,
        }
    }
}

async fn join_readers(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_exit(jobs: &JobManager, id: &str) -> JobPoll {
        let mut stdout = String::new();
        let mut stderr = String::new();
        for _ in 0..100 {
            let poll = jobs.poll(id).await.unwrap();
            stdout.push_str(&poll.new_stdout);
            stderr.push_str(&poll.new_stderr);
            if !poll.status.is_active() {
                return JobPoll { new_stdout: stdout, new_stderr: stderr, ..poll };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_job_completes_with_output() {
        let jobs = JobManager::new();
        let id = jobs.spawn("echo one; echo two", None).await.unwrap();
        assert!(id.starts_with("job_"));

        let poll = wait_for_exit(&jobs, &id).await;
        assert_eq!(poll.status, JobStatus::Completed);
        assert_eq!(poll.exit_code, Some(0));
        assert_eq!(poll.new_stdout, "one\ntwo\n");

        // output is only reported once
        let again = jobs.poll(&id).await.unwrap();
        assert!(again.new_stdout.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_reports_exit_code_and_stderr() {
        let jobs = JobManager::new();
        let id = jobs.spawn("echo oops >&2; exit 3", None).await.unwrap();
        let poll = wait_for_exit(&jobs, &id).await;
        assert_eq!(poll.status, JobStatus::Failed);
        assert_eq!(poll.exit_code, Some(3));
        assert_eq!(poll.new_stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_list_and_kill() {
        let jobs = JobManager::new();
        let id = jobs.spawn("sleep 30", None).await.unwrap();

        let active = jobs.list(true).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);

        assert!(jobs.kill(&id).await);
        let poll = wait_for_exit(&jobs, &id).await;
        assert_eq!(poll.status, JobStatus::Terminated);
        assert!(jobs.list(true).await.is_empty());
        assert_eq!(jobs.list(false).await.len(), 1);
        assert!(!jobs.kill(&id).await);
    }

    #[tokio::test]
    async fn test_unknown_job_and_bad_cwd() {
        let jobs = JobManager::new();
        assert!(jobs.poll("job_missing").await.is_err());
        assert!(jobs.spawn("true", Some(Path::new("/definitely/not/here"))).await.is_err());
    }

    #[test]
    fn test_poll_display() {
        let poll = JobPoll {
            id: "job_1".into(),
            status: JobStatus::Failed,
            exit_code: Some(2),
            new_stdout: "out\n".into(),
            new_stderr: String::new(),
        };
        assert_eq!(poll.to_string(), "Job ID: job_1\nStatus: FAILED (Exit: 2)\n[STDOUT]:\nout\n");
    }
}
