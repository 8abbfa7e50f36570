//! Escalation to an external AI code-fix service.
//!
//! The bridge owns prompt construction and the poll loop; the HTTP details
//! live behind [`CodeFixBackend`].

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{NaiveDate, Utc};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_CODEFIX_POLL: Duration = Duration::from_secs(15);
pub const DEFAULT_CODEFIX_TIMEOUT: Duration = Duration::from_secs(600);
/// Launches allowed per UTC day; each launch may open a pull request.
pub const DEFAULT_CODEFIX_MAX_PER_DAY: usize = 5;

/// Only the tail of the logs is sent.
pub const LOG_TAIL_CHARS: usize = 3000;

pub const SAFETY_PREAMBLE: &str = "\
You are repairing a production system. Rules you must follow:
- NEVER delete existing functionality; preserve existing behavior.
- Preserve ALL existing interfaces: public APIs, CLI flags, config keys and wire formats.
- Do NOT delete data, databases, volumes or user files.
- Do NOT change credentials, secrets or access control.
- Do NOT push to the main branch directly; open a branch with your fix.
- Keep the change minimal and focused on the reported problem.
- If the root cause is unclear, explain what you found instead of guessing.";

const INSTRUCTIONS: &str = "\
Find the root cause of the problem above, implement a minimal fix, and \
describe what you changed and how to verify it.";

#[async_trait]
pub trait CodeFixBackend: Send + Sync {
    /// `false` when credentials are missing; calls must then fail without I/O.
    fn is_configured(&self) -> bool;
    /// Start a job and return its id.
    async fn launch(&self, prompt: &str) -> Result<String>;
    /// Raw remote status string.
    async fn status(&self, agent_id: &str) -> Result<String>;
    async fn followup(&self, agent_id: &str, message: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Launched,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    /// Map a remote status string. Unknown strings count as still running.
    pub fn from_remote(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "completed" | "succeeded" | "done" | "finished" => Self::Completed,
            "failed" | "error" | "cancelled" | "canceled" | "expired" => Self::Failed,
            "created" | "launched" | "queued" | "pending" => Self::Launched,
            _ => Self::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched { agent_id: String },
    NotConfigured,
    /// The daily launch cap is spent; nothing was sent.
    LimitReached { limit: usize },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeFixJob {
    pub agent_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Launches counted against the current UTC day.
#[derive(Debug, Clone, Copy)]
struct DailyCount {
    day: NaiveDate,
    launches: usize,
}

pub struct CodeFixBridge {
    backend: Arc<dyn CodeFixBackend>,
    poll_interval: Duration,
    max_per_day: usize,
    today: Mutex<DailyCount>,
}

impl CodeFixBridge {
    pub fn new(backend: Arc<dyn CodeFixBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            max_per_day: DEFAULT_CODEFIX_MAX_PER_DAY,
            today: Mutex::new(DailyCount {
                day: Utc::now().date_naive(),
                launches: 0,
            }),
        }
    }

    pub fn with_daily_limit(mut self, max_per_day: usize) -> Self {
        self.max_per_day = max_per_day;
        self
    }

    pub fn daily_limit(&self) -> usize {
        self.max_per_day
    }

    /// Successful launches so far today.
    pub fn launches_today(&self) -> usize {
        self.launches_on(Utc::now().date_naive())
    }

    fn launches_on(&self, day: NaiveDate) -> usize {
        let mut count = self.today.lock().unwrap_or_else(|e| e.into_inner());
        if count.day != day {
            *count = DailyCount { day, launches: 0 };
        }
        count.launches
    }

    fn record_launch(&self) {
        let day = Utc::now().date_naive();
        let mut count = self.today.lock().unwrap_or_else(|e| e.into_inner());
        if count.day != day {
            *count = DailyCount { day, launches: 0 };
        }
        count.launches += 1;
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_configured()
    }

    pub async fn launch(&self, problem: &str, logs: &str, context: &str) -> LaunchOutcome {
        if !self.backend.is_configured() {
            warn!("code-fix service not configured, cannot escalate");
            return LaunchOutcome::NotConfigured;
        }
        let launched = self.launches_today();
        if launched >= self.max_per_day {
            warn!(launched, limit = self.max_per_day, "daily code-fix limit reached");
            return LaunchOutcome::LimitReached {
                limit: self.max_per_day,
            };
        }
        let prompt = build_prompt(problem, logs, context);
        match self.backend.launch(&prompt).await {
            Ok(agent_id) => {
                self.record_launch();
                info!(agent_id, "code-fix job launched");
                LaunchOutcome::Launched { agent_id }
            }
            Err(e) => {
                warn!("code-fix launch failed: {e:#}");
                LaunchOutcome::Failed(format!("{e:#}"))
            }
        }
    }

    pub async fn poll(&self, agent_id: &str) -> Result<JobStatus> {
        let raw = self.backend.status(agent_id).await?;
        Ok(JobStatus::from_remote(&raw))
    }

    /// Poll until a terminal status or `timeout`. Poll errors are retried.
    /// On timeout the remote job is left running.
    pub async fn wait_for_completion(&self, agent_id: &str, timeout: Duration) -> CodeFixJob {
        let deadline = Instant::now() + timeout;
        let mut last_error = None;
        loop {
            match self.poll(agent_id).await {
                Ok(status) if status.is_terminal() => {
                    info!(agent_id, status = ?status, "code-fix job finished");
                    return CodeFixJob {
                        agent_id: agent_id.to_string(),
                        status,
                        error: None,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(agent_id, "code-fix status poll failed: {e:#}");
                    last_error = Some(format!("{e:#}"));
                }
            }

            if Instant::now() >= deadline {
                warn!(agent_id, timeout_s = timeout.as_secs(), "code-fix job timed out");
                return CodeFixJob {
                    agent_id: agent_id.to_string(),
                    status: JobStatus::TimedOut,
                    error: last_error,
                };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn followup(&self, agent_id: &str, message: &str) -> Result<()> {
        self.backend.followup(agent_id, message).await
    }
}

pub fn build_prompt(problem: &str, logs: &str, context: &str) -> String {
    let mut prompt = format!("{SAFETY_PREAMBLE}\n\n## Problem\n{problem}\n");
    if !context.is_empty() {
        prompt.push_str(&format!("\n## Context\n{context}\n"));
    }
    if !logs.trim().is_empty() {
        prompt.push_str(&format!("\n## Recent logs\n```\n{}\n```\n", tail_chars(logs, LOG_TAIL_CHARS)));
    }
    prompt.push_str(&format!("\n## Task\n{INSTRUCTIONS}\n"));
    prompt
}

/// The last `n` characters of `s`.
pub fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}
