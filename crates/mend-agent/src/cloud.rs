use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mend_core::{codefix::CodeFixBackend, verifier::is_valid_unit_name};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Client for a hosted background-agent API that opens pull requests against
/// a repository (`POST /agents`, `GET /agents/{id}`, `POST /agents/{id}/followup`).
///
/// Constructed even without an API key so the rest of the system can start;
/// every call then fails immediately without touching the network.
pub struct CloudAgentBackend {
    pub base_url: String,
    pub repo_url: String,
    pub branch: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PromptText<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Source<'a> {
    repository: &'a str,
    #[serde(rename = "ref")]
    git_ref: &'a str,
}

#[derive(Serialize)]
struct LaunchRequest<'a> {
    prompt: PromptText<'a>,
    source: Source<'a>,
}

#[derive(Serialize)]
struct FollowupRequest<'a> {
    prompt: PromptText<'a>,
}

impl CloudAgentBackend {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            warn!("CODEFIX_API_KEY is not set: code-fix escalation is disabled");
        }
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            repo_url: String::new(),
            branch: "main".into(),
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_repo(mut self, repo_url: impl Into<String>, branch: impl Into<String>) -> Self {
        self.repo_url = repo_url.into();
        let branch = branch.into();
        if !branch.is_empty() {
            self.branch = branch;
        }
        self
    }

    fn ensure_configured(&self) -> Result<()> {
        if !self.is_configured() {
            bail!("code-fix service not configured (CODEFIX_API_KEY is empty)");
        }
        Ok(())
    }

    async fn send_json(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let resp = req
            .bearer_auth(&self.api_key)
            .send()
            .await
            .with_context(|| format!("{what} request"))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("{what} returned HTTP {status}: {}", truncate(&body, 300));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).with_context(|| format!("{what} response parse"))
    }
}

/// Job id from a launch response: `id`, falling back to `agent_id`.
/// Agent ids end up in the request path, so only plain ids are accepted.
fn check_agent_id(agent_id: &str) -> Result<()> {
    if !is_valid_unit_name(agent_id, false) {
        bail!("invalid agent id {agent_id:?}");
    }
    Ok(())
}

pub fn extract_agent_id(resp: &Value) -> Option<String> {
    ["id", "agent_id"]
        .iter()
        .find_map(|k| resp.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Status string from a poll response, tolerating an outer `data` wrapper.
pub fn extract_status(resp: &Value) -> Option<String> {
    resp.get("status")
        .or_else(|| resp.get("data").and_then(|d| d.get("status")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[async_trait]
impl CodeFixBackend for CloudAgentBackend {
    fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn launch(&self, prompt: &str) -> Result<String> {
        self.ensure_configured()?;
        if self.repo_url.is_empty() {
            bail!("CODEFIX_REPO_URL not configured");
        }
        let body = LaunchRequest {
            prompt: PromptText { text: prompt },
            source: Source {
                repository: &self.repo_url,
                git_ref: &self.branch,
            },
        };
        info!(repo = %self.repo_url, branch = %self.branch, "launching code-fix agent");
        let resp = self
            .send_json(
                self.client.post(format!("{}/agents", self.base_url)).json(&body),
                "launch",
            )
            .await?;
        extract_agent_id(&resp).context("launch response has no agent id")
    }

    async fn status(&self, agent_id: &str) -> Result<String> {
        self.ensure_configured()?;
        check_agent_id(agent_id)?;
        let resp = self
            .send_json(
                self.client.get(format!("{}/agents/{agent_id}", self.base_url)),
                "status",
            )
            .await?;
        Ok(extract_status(&resp).unwrap_or_else(|| "unknown".to_string()))
    }

    async fn followup(&self, agent_id: &str, message: &str) -> Result<()> {
        self.ensure_configured()?;
        check_agent_id(agent_id)?;
        let body = FollowupRequest {
            prompt: PromptText { text: message },
        };
        self.send_json(
            self.client
                .post(format!("{}/agents/{agent_id}/followup", self.base_url))
                .json(&body),
            "followup",
        )
        .await?;
        info!(agent_id, "follow-up sent to code-fix agent");
        Ok(())
    }
}
