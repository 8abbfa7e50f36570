use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::types::CheckResult;

/// Produces a full health sweep on demand.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn run_all(&self) -> Result<Vec<CheckResult>>;
}

/// Fetches the sweep from the monitor's HTTP endpoint.
///
/// Accepts either a bare JSON array of checks or `{"checks": [...]}`.
pub struct HttpHealthSource {
    url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SweepBody {
    Bare(Vec<CheckResult>),
    Wrapped { checks: Vec<CheckResult> },
}

impl HttpHealthSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl HealthSource for HttpHealthSource {
    async fn run_all(&self) -> Result<Vec<CheckResult>> {
        if self.url.is_empty() {
            bail!("HEALTH_URL not configured");
        }
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("health sweep request to {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("health sweep returned HTTP {status}");
        }
        let body: SweepBody = resp.json().await.context("parse health sweep")?;
        Ok(match body {
            SweepBody::Bare(checks) | SweepBody::Wrapped { checks } => checks,
        })
    }
}
