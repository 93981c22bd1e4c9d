//! Action directives embedded in model output, and their dispatch.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use vistalk_core::config::ActionsConfig;

static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ROBOT_ACTION:\s*(\w+)").expect("valid action pattern"));

/// Find the first `ROBOT_ACTION:<name>` in raw model output whose name is
/// in `allowed`.
///
/// Runs on the raw text; the sanitizer strips underscores that action names
/// usually contain.
pub fn extract_action(raw: &str, allowed: &[String]) -> Option<String> {
    let name = ACTION_RE.captures(raw)?.get(1)?.as_str();
    if allowed.iter().any(|a| a == name) {
        Some(name.to_string())
    } else {
        warn!(action = name, "Model requested an action that is not allowed");
        None
    }
}

/// Outcome of handing an action to the robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: bool,
    pub error: Option<String>,
}

impl DispatchReport {
    pub fn ok() -> Self {
        Self {
            dispatched: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            dispatched: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: &str) -> DispatchReport;
}

/// Robot controller reachable over HTTP at `<base_url>/trigger`.
pub struct HttpRobot {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpRobot {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    /// `None` when no robot endpoint is configured.
    pub fn from_config(config: &ActionsConfig) -> Option<Self> {
        config
            .resolve_robot_url()
            .map(|url| Self::new(&url, config.timeout()))
    }
}

#[async_trait]
impl ActionDispatcher for HttpRobot {
    async fn dispatch(&self, action: &str) -> DispatchReport {
        let url = format!("{}/trigger", self.base_url);
        let result = self
            .client
            .post(&url)
            .json(&json!({ "task": action }))
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(action, %url, "Robot task sent");
                DispatchReport::ok()
            }
            Ok(resp) => {
                warn!(action, status = %resp.status(), "Robot rejected task");
                DispatchReport::failed(format!("HTTP {}", resp.status().as_u16()))
            }
            Err(e) => {
                warn!(action, %e, "Robot unreachable");
                DispatchReport::failed(e.to_string())
            }
        }
    }
}
