use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ── Health Checks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    /// Informational only (e.g. an idle agent). Never treated as a failure.
    Info,
}

impl CheckStatus {
    pub fn is_failing(self) -> bool {
        matches!(self, Self::Warning | Self::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a health sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub value: String,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, status: CheckStatus, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            value: value.into(),
        }
    }
}

/// A failing (or recovered) check as delivered by the monitor through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub value: String,
    #[serde(
        default = "Utc::now",
        alias = "reported_at",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
}

impl ProblemReport {
    pub fn new(name: impl Into<String>, status: CheckStatus, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            value: value.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Parse RFC 3339, falling back to a naive ISO-8601 timestamp interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|n| n.and_utc())
        })
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.as_deref().and_then(parse_timestamp).unwrap_or_else(Utc::now))
}

// ── Classification ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairLevel {
    /// Fixed automatically, no human involved.
    Auto = 1,
    /// Needs an operator's approval before anything runs.
    Approve = 2,
    /// Escalated to the external code-fix service, after approval.
    Cursor = 3,
}

impl RepairLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Auto),
            2 => Some(Self::Approve),
            3 => Some(Self::Cursor),
            _ => None,
        }
    }

    /// Label shown to operators in approval requests.
    pub fn label(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Approve => "CONFIG",
            Self::Cursor => "CURSOR/CODE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    ServiceDown,
    ContainerDown,
    DiskFull,
    HighCpu,
    HighRam,
    DependencyDown,
    GatewayError,
    AgentError,
    CodeError,
    Unknown,
}

impl ProblemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceDown => "service_down",
            Self::ContainerDown => "container_down",
            Self::DiskFull => "disk_full",
            Self::HighCpu => "high_cpu",
            Self::HighRam => "high_ram",
            Self::DependencyDown => "dependency_down",
            Self::GatewayError => "gateway_error",
            Self::AgentError => "agent_error",
            Self::CodeError => "code_error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairAction {
    #[serde(rename = "restart_systemd")]
    RestartService,
    #[serde(rename = "restart_container")]
    RestartContainer,
    #[serde(rename = "cleanup_disk")]
    CleanupDisk,
    #[serde(rename = "log_and_wait")]
    LogAndWait,
    #[serde(rename = "cursor_diagnose")]
    CodeFixDiagnose,
    #[serde(rename = "investigate_agent")]
    InvestigateAgent,
    #[serde(rename = "notify_admin")]
    NotifyAdmin,
}

impl RepairAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestartService => "restart_systemd",
            Self::RestartContainer => "restart_container",
            Self::CleanupDisk => "cleanup_disk",
            Self::LogAndWait => "log_and_wait",
            Self::CodeFixDiagnose => "cursor_diagnose",
            Self::InvestigateAgent => "investigate_agent",
            Self::NotifyAdmin => "notify_admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::RestartService,
            Self::RestartContainer,
            Self::CleanupDisk,
            Self::LogAndWait,
            Self::CodeFixDiagnose,
            Self::InvestigateAgent,
            Self::NotifyAdmin,
        ]
        .into_iter()
        .find(|a| a.as_str() == s)
    }

    /// Actions with no command behind them; the approval request is the whole point.
    pub fn is_informational(self) -> bool {
        matches!(self, Self::NotifyAdmin | Self::InvestigateAgent)
    }

    /// Actions whose effect is judged by re-running the health sweep.
    pub fn needs_verification(self) -> bool {
        matches!(
            self,
            Self::RestartService | Self::RestartContainer | Self::CleanupDisk
        )
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    DockerPrune,
    LogRotate,
    TmpCleanup,
}

impl CleanupStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DockerPrune => "docker_prune",
            Self::LogRotate => "log_rotate",
            Self::TmpCleanup => "tmp_cleanup",
        }
    }
}

/// Action-specific parameters attached to a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDetails {
    pub check_name: String,
    pub value: String,
    /// Resolved service / container / agent name for targeted actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Ordered sub-steps for disk cleanup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<CleanupStep>,
    /// Failure context handed to the code-fix service on escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// What the agent should do about one problem report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub problem_type: ProblemType,
    pub level: RepairLevel,
    pub source_check: String,
    pub description: String,
    pub action: RepairAction,
    pub details: ActionDetails,
}

// ── Execution ────────────────────────────────────────────────────────────

/// Why an action was refused before any command ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refusal {
    RateLimited,
    NotAllowed,
    MissingTarget,
    InvalidName,
    UnknownAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    pub output: String,
    /// Set when nothing was executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<Refusal>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            output: output.into(),
            refusal: None,
        }
    }

    pub fn failed(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            output: output.into(),
            refusal: None,
        }
    }

    pub fn refused(refusal: Refusal, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            output: String::new(),
            refusal: Some(refusal),
        }
    }
}

// ── Approvals ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// A decision request as stored for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub level: RepairLevel,
    pub description: String,
    pub action: RepairAction,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

// ── Repair Log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    Succeeded,
    Failed,
    /// The original check cleared but other checks started failing.
    Regressed,
    /// The original check is still failing after the action.
    Persisted,
    Rejected,
    TimedOut,
    RateLimited,
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairResult {
    pub success: bool,
    pub message: String,
    pub outcome: RepairOutcome,
}

impl RepairResult {
    pub fn new(success: bool, message: impl Into<String>, outcome: RepairOutcome) -> Self {
        Self {
            success,
            message: message.into(),
            outcome,
        }
    }
}

/// One completed repair cycle. Written once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub check: String,
    pub status: CheckStatus,
    pub level: RepairLevel,
    pub action: RepairAction,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub result: RepairResult,
}

// ── Events ───────────────────────────────────────────────────────────────

/// Broadcast after each significant state change of a repair cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairEvent {
    Classified {
        check: String,
        level: RepairLevel,
        action: RepairAction,
    },
    AwaitingApproval {
        check: String,
        request_id: String,
    },
    Completed {
        record: RepairRecord,
    },
}

impl RepairEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::Classified { .. } => "classified",
            Self::AwaitingApproval { .. } => "awaiting_approval",
            Self::Completed { .. } => "completed",
        }
    }

    pub fn check(&self) -> &str {
        match self {
            Self::Classified { check, .. } | Self::AwaitingApproval { check, .. } => check,
            Self::Completed { record } => &record.check,
        }
    }
}
