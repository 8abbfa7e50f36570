use std::{collections::HashMap, time::Duration};

use crate::{
    approval::{DEFAULT_APPROVAL_POLL, DEFAULT_APPROVAL_TIMEOUT, DEFAULT_DECISION_TTL},
    classifier::DEFAULT_ESCALATION_THRESHOLD,
    codefix::{DEFAULT_CODEFIX_MAX_PER_DAY, DEFAULT_CODEFIX_POLL, DEFAULT_CODEFIX_TIMEOUT},
    db::DEFAULT_REPAIR_LOG_CAP,
    executor::DEFAULT_MAX_ACTIONS_PER_HOUR,
    verifier::DEFAULT_VERIFY_DELAY,
};

pub const DEFAULT_CODEFIX_API_URL: &str = "https://api.cursor.com/v0";
pub const DEFAULT_QUEUE_POLL: Duration = Duration::from_secs(5);

/// Full application configuration, read from the environment with a `.env`
/// fallback. Secrets (bot token, code-fix key) only ever come from there.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Notifications
    pub telegram_token: String,
    /// Chat that receives notifications and may approve or reject.
    pub admin_chat_id: i64,

    // Health source
    pub health_url: String,

    // Code-fix service
    pub codefix_api_key: String,
    pub codefix_api_url: String,
    pub codefix_repo_url: String,
    pub codefix_repo_branch: String,
    pub codefix_timeout: Duration,
    pub codefix_poll: Duration,
    /// Cap on code-fix launches per UTC day.
    pub codefix_max_per_day: usize,

    // Repair policy
    pub escalation_threshold: u32,
    pub max_actions_per_hour: usize,
    pub verify_delay: Duration,
    pub approval_timeout: Duration,
    pub approval_poll: Duration,
    pub decision_ttl: Duration,
    pub queue_poll: Duration,
    pub repair_log_cap: usize,

    // Web
    /// Bearer token for the control routes; they are disabled while empty.
    pub api_token: String,
    pub web_bind: String,
    pub web_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "store".into(),
            telegram_token: String::new(),
            admin_chat_id: 0,
            health_url: String::new(),
            codefix_api_key: String::new(),
            codefix_api_url: DEFAULT_CODEFIX_API_URL.into(),
            codefix_repo_url: String::new(),
            codefix_repo_branch: "main".into(),
            codefix_timeout: DEFAULT_CODEFIX_TIMEOUT,
            codefix_poll: DEFAULT_CODEFIX_POLL,
            codefix_max_per_day: DEFAULT_CODEFIX_MAX_PER_DAY,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            max_actions_per_hour: DEFAULT_MAX_ACTIONS_PER_HOUR,
            verify_delay: DEFAULT_VERIFY_DELAY,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            approval_poll: DEFAULT_APPROVAL_POLL,
            decision_ttl: DEFAULT_DECISION_TTL,
            queue_poll: DEFAULT_QUEUE_POLL,
            repair_log_cap: DEFAULT_REPAIR_LOG_CAP,
            api_token: String::new(),
            web_bind: "127.0.0.1".into(),
            web_port: 3141,
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_parsed<T: std::str::FromStr>(key: &str, dotenv: &HashMap<String, String>, default: T) -> T {
    get(key, dotenv)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn get_secs(key: &str, dotenv: &HashMap<String, String>, default: Duration) -> Duration {
    Duration::from_secs(get_parsed(key, dotenv, default.as_secs()))
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(&parse_dotenv())
    }

    fn from_lookup(dotenv: &HashMap<String, String>) -> Self {
        let d = Self::default();
        Self {
            data_dir: get_str("DATA_DIR", dotenv, &d.data_dir),
            telegram_token: get_str("TELEGRAM_BOT_TOKEN", dotenv, ""),
            admin_chat_id: get_parsed("ADMIN_CHAT_ID", dotenv, 0),
            health_url: get_str("HEALTH_URL", dotenv, ""),
            codefix_api_key: get_str("CODEFIX_API_KEY", dotenv, ""),
            codefix_api_url: get_str("CODEFIX_API_URL", dotenv, &d.codefix_api_url)
                .trim_end_matches('/')
                .to_string(),
            codefix_repo_url: get_str("CODEFIX_REPO_URL", dotenv, ""),
            codefix_repo_branch: get_str("CODEFIX_REPO_BRANCH", dotenv, &d.codefix_repo_branch),
            codefix_timeout: get_secs("CODEFIX_TIMEOUT_S", dotenv, d.codefix_timeout),
            codefix_poll: get_secs("CODEFIX_POLL_S", dotenv, d.codefix_poll),
            codefix_max_per_day: get_parsed("CODEFIX_MAX_PER_DAY", dotenv, d.codefix_max_per_day),
            escalation_threshold: get_parsed("ESCALATION_THRESHOLD", dotenv, d.escalation_threshold),
            max_actions_per_hour: get_parsed("MAX_ACTIONS_PER_HOUR", dotenv, d.max_actions_per_hour),
            verify_delay: get_secs("VERIFY_DELAY_S", dotenv, d.verify_delay),
            approval_timeout: get_secs("APPROVAL_TIMEOUT_S", dotenv, d.approval_timeout),
            approval_poll: get_secs("APPROVAL_POLL_S", dotenv, d.approval_poll),
            decision_ttl: get_secs("DECISION_TTL_S", dotenv, d.decision_ttl),
            queue_poll: get_secs("QUEUE_POLL_S", dotenv, d.queue_poll),
            repair_log_cap: get_parsed("REPAIR_LOG_CAP", dotenv, d.repair_log_cap),
            api_token: get_str("API_TOKEN", dotenv, "").trim().to_string(),
            web_bind: get_str("WEB_BIND", dotenv, &d.web_bind),
            web_port: get_parsed("WEB_PORT", dotenv, d.web_port),
        }
    }

    pub fn db_path(&self) -> String {
        format!("{}/mend.db", self.data_dir)
    }

    pub fn telegram_enabled(&self) -> bool {
        !self.telegram_token.is_empty() && self.admin_chat_id != 0
    }
}
