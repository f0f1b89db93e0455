use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ScrapeError;

/// Snapshot of a matched element, captured as its outer HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub outer_html: String,
}

/// One isolated browsing context. Dropped contexts must be closed first.
#[async_trait]
pub trait BrowserEngine: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), ScrapeError>;

    /// `Ok(false)` when nothing matched before `timeout`.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool, ScrapeError>;

    async fn query_selector_all(&mut self, selector: &str) -> Result<Vec<ElementHandle>, ScrapeError>;

    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&mut self, script: &str) -> Result<JsonValue, ScrapeError>;

    async fn close(&mut self) -> Result<(), ScrapeError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Fresh context, seeded with `auth` when given.
    async fn new_context(&self, auth: Option<&AuthState>) -> Result<Box<dyn BrowserEngine>, ScrapeError>;
}

/// Captured login state in the browser storage-state JSON layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    #[serde(default)]
    pub cookies: Vec<AuthCookie>,
    #[serde(default)]
    pub origins: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Seconds since the epoch; `-1` marks a session cookie.
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl AuthState {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading auth state {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing auth state {}", path.display()))
    }

    /// Distinct cookie hosts, leading dots stripped, in first-seen order.
    pub fn cookie_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for cookie in &self.cookies {
            let host = cookie.domain.trim_start_matches('.').to_string();
            if !host.is_empty() && !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }
}
