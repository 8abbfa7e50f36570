#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use mend_core::{
    codefix::CodeFixBackend,
    command::{CommandOutput, CommandRunner},
    config::Config,
    db::Db,
    health::HealthSource,
    notify::{Notification, Notifier},
    orchestrator::{AgentDeps, RepairAgent},
    CheckResult, CheckStatus,
};

// ── Commands ─────────────────────────────────────────────────────────────

type Responder = dyn Fn(&str, &[&str]) -> Result<CommandOutput> + Send + Sync;

pub struct FakeRunner {
    calls: Mutex<Vec<String>>,
    responder: Box<Responder>,
}

pub fn out(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

impl FakeRunner {
    /// Every command succeeds with empty output.
    pub fn ok() -> Arc<Self> {
        Self::with(|_, _| Ok(out(0, "", "")))
    }

    pub fn with(f: impl Fn(&str, &[&str]) -> Result<CommandOutput> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(f),
        })
    }

    /// Each call rendered as `program arg1 arg2 ...`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> Result<CommandOutput> {
        let mut line = program.to_string();
        for a in args {
            line.push(' ');
            line.push_str(a);
        }
        self.calls.lock().unwrap().push(line);
        (self.responder)(program, args)
    }
}

// ── Health ───────────────────────────────────────────────────────────────

/// Returns queued sweeps in order; the last one repeats.
pub struct FakeHealth {
    sweeps: Mutex<VecDeque<Result<Vec<CheckResult>, String>>>,
    last: Mutex<Result<Vec<CheckResult>, String>>,
    calls: Mutex<usize>,
}

impl FakeHealth {
    pub fn new(sweeps: Vec<Result<Vec<CheckResult>, String>>) -> Arc<Self> {
        Arc::new(Self {
            sweeps: Mutex::new(sweeps.into()),
            last: Mutex::new(Ok(Vec::new())),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl HealthSource for FakeHealth {
    async fn run_all(&self) -> Result<Vec<CheckResult>> {
        *self.calls.lock().unwrap() += 1;
        let next = self.sweeps.lock().unwrap().pop_front();
        let res = match next {
            Some(r) => {
                *self.last.lock().unwrap() = r.clone();
                r
            }
            None => self.last.lock().unwrap().clone(),
        };
        res.map_err(|e| anyhow!(e))
    }
}

pub fn check(name: &str, status: CheckStatus) -> CheckResult {
    CheckResult::new(name, status, "")
}

// ── Notifications ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.text).collect()
    }

    pub fn any_contains(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ── Code fix ─────────────────────────────────────────────────────────────

pub struct FakeCodeFix {
    pub configured: bool,
    pub launch_error: Option<String>,
    statuses: Mutex<VecDeque<Result<String, String>>>,
    pub prompts: Mutex<Vec<String>>,
    pub followups: Mutex<Vec<(String, String)>>,
    pub status_calls: Mutex<usize>,
}

impl FakeCodeFix {
    pub fn new(statuses: Vec<Result<&str, &str>>) -> Arc<Self> {
        Arc::new(Self {
            configured: true,
            launch_error: None,
            statuses: Mutex::new(
                statuses
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            prompts: Mutex::new(Vec::new()),
            followups: Mutex::new(Vec::new()),
            status_calls: Mutex::new(0),
        })
    }

    pub fn unconfigured() -> Arc<Self> {
        let mut f = Arc::try_unwrap(Self::new(vec![])).ok().unwrap();
        f.configured = false;
        Arc::new(f)
    }

    pub fn failing_launch(err: &str) -> Arc<Self> {
        let mut f = Arc::try_unwrap(Self::new(vec![])).ok().unwrap();
        f.launch_error = Some(err.to_string());
        Arc::new(f)
    }

    pub fn status_calls(&self) -> usize {
        *self.status_calls.lock().unwrap()
    }
}

#[async_trait]
impl CodeFixBackend for FakeCodeFix {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn launch(&self, prompt: &str) -> Result<String> {
        if !self.configured {
            bail!("not configured");
        }
        self.prompts.lock().unwrap().push(prompt.to_string());
        match &self.launch_error {
            Some(e) => bail!("{e}"),
            None => Ok("bc-123".to_string()),
        }
    }

    async fn status(&self, _agent_id: &str) -> Result<String> {
        *self.status_calls.lock().unwrap() += 1;
        match self.statuses.lock().unwrap().pop_front() {
            Some(Ok(s)) => Ok(s),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok("RUNNING".to_string()),
        }
    }

    async fn followup(&self, agent_id: &str, message: &str) -> Result<()> {
        self.followups
            .lock()
            .unwrap()
            .push((agent_id.to_string(), message.to_string()));
        Ok(())
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────

/// Config with every wait shortened for tests.
pub fn fast_config() -> Config {
    Config {
        verify_delay: Duration::ZERO,
        approval_timeout: Duration::from_secs(5),
        approval_poll: Duration::from_millis(10),
        queue_poll: Duration::from_millis(10),
        codefix_poll: Duration::from_millis(1),
        codefix_timeout: Duration::from_millis(200),
        ..Config::default()
    }
}

pub fn memory_db() -> Arc<Db> {
    let mut db = Db::open_in_memory().unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

pub struct Harness {
    pub agent: RepairAgent,
    pub db: Arc<Db>,
    pub runner: Arc<FakeRunner>,
    pub health: Arc<FakeHealth>,
    pub notifier: Arc<RecordingNotifier>,
    pub codefix: Arc<FakeCodeFix>,
}

pub fn harness(
    config: Config,
    runner: Arc<FakeRunner>,
    health: Arc<FakeHealth>,
    codefix: Arc<FakeCodeFix>,
) -> Harness {
    let db = memory_db();
    let notifier = RecordingNotifier::new();
    let agent = RepairAgent::new(
        config,
        AgentDeps {
            db: Arc::clone(&db),
            runner: runner.clone(),
            health: health.clone(),
            notifier: notifier.clone(),
            codefix: codefix.clone(),
        },
    );
    Harness {
        agent,
        db,
        runner,
        health,
        notifier,
        codefix,
    }
}

/// Resolve the first pending approval request once it appears.
pub fn decide_when_pending(db: Arc<Db>, approved: bool) -> tokio::task::JoinHandle<Option<String>> {
    tokio::spawn(async move {
        for _ in 0..500 {
            if let Some(req) = db.list_pending_approvals().unwrap().into_iter().next() {
                db.resolve_approval(&req.request_id, approved).unwrap();
                return Some(req.request_id);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    })
}
