//! W3C WebDriver-backed browser engine (chromedriver, geckodriver, selenium grid).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::engine::{AuthCookie, AuthState, BrowserEngine, BrowserLauncher, ElementHandle};
use crate::ScrapeError;

const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const OUTER_HTML_SCRIPT: &str =
    "return Array.from(document.querySelectorAll(arguments[0])).map(e => e.outerHTML);";

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub page_load_timeout: Duration,
    pub headless: bool,
    pub window: (u32, u32),
    pub user_agent: Option<String>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4444".to_string(),
            request_timeout: Duration::from_secs(60),
            page_load_timeout: Duration::from_secs(30),
            headless: true,
            window: (1280, 1024),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    client: reqwest::Client,
    config: WebDriverConfig,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn capabilities(&self) -> JsonValue {
        let (width, height) = self.config.window;
        let mut args = vec![format!("--window-size={width},{height}")];
        if self.config.headless {
            args.push("--headless=new".to_string());
        }
        if let Some(ua) = &self.config.user_agent {
            args.push(format!("--user-agent={ua}"));
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "timeouts": {
                        "pageLoad": self.config.page_load_timeout.as_millis() as u64,
                        "script": self.config.page_load_timeout.as_millis() as u64,
                    },
                    "goog:chromeOptions": { "args": args },
                }
            }
        })
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn new_context(&self, auth: Option<&AuthState>) -> Result<Box<dyn BrowserEngine>, ScrapeError> {
        let base = self.config.base_url.trim_end_matches('/').to_string();
        let value = send(
            &self.client,
            Method::POST,
            format!("{base}/session"),
            Some(self.capabilities()),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ScrapeError::Engine("new session response lacks sessionId".into()))?
            .to_string();
        debug!(session_id, "opened webdriver session");

        let mut engine = WebDriverEngine {
            client: self.client.clone(),
            session_url: Some(format!("{base}/session/{session_id}")),
        };
        if let Some(auth) = auth {
            if let Err(err) = engine.install_cookies(auth).await {
                let _ = engine.close().await;
                return Err(err);
            }
        }
        Ok(Box::new(engine))
    }
}

pub struct WebDriverEngine {
    client: reqwest::Client,
    session_url: Option<String>,
}

impl WebDriverEngine {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<JsonValue, ScrapeError> {
        let session_url = self
            .session_url
            .as_deref()
            .ok_or_else(|| ScrapeError::Engine("webdriver session already closed".into()))?;
        send(&self.client, method, format!("{session_url}{path}"), body).await
    }

    /// Cookies can only be set for the current document's host, so visit each host first.
    async fn install_cookies(&mut self, auth: &AuthState) -> Result<(), ScrapeError> {
        for host in auth.cookie_hosts() {
            self.navigate(&format!("https://{host}/")).await?;
            for cookie in auth
                .cookies
                .iter()
                .filter(|c| c.domain.trim_start_matches('.') == host)
            {
                self.command(Method::POST, "/cookie", Some(json!({ "cookie": cookie_payload(cookie) })))
                    .await?;
            }
            debug!(host, "installed auth cookies");
        }
        Ok(())
    }
}

fn cookie_payload(cookie: &AuthCookie) -> JsonValue {
    let mut payload = json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path,
        "secure": cookie.secure,
        "httpOnly": cookie.http_only,
    });
    if let Some(expires) = cookie.expires.filter(|e| *e > 0.0) {
        payload["expiry"] = json!(expires as u64);
    }
    if let Some(same_site) = &cookie.same_site {
        payload["sameSite"] = json!(same_site);
    }
    payload
}

async fn send(
    client: &reqwest::Client,
    method: Method,
    url: String,
    body: Option<JsonValue>,
) -> Result<JsonValue, ScrapeError> {
    let mut request = client.request(method, &url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let payload: JsonValue = response.json().await?;
    let value = payload.get("value").cloned().unwrap_or(JsonValue::Null);
    if !status.is_success() {
        let error = value.get("error").and_then(JsonValue::as_str).unwrap_or("unknown error");
        let message = value.get("message").and_then(JsonValue::as_str).unwrap_or_default();
        return Err(ScrapeError::Engine(format!("{url} -> {status}: {error}: {message}")));
    }
    Ok(value)
}

#[async_trait]
impl BrowserEngine for WebDriverEngine {
    async fn navigate(&mut self, url: &str) -> Result<(), ScrapeError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
            .map_err(|err| ScrapeError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            })
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool, ScrapeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self
                .command(
                    Method::POST,
                    "/elements",
                    Some(json!({ "using": "css selector", "value": selector })),
                )
                .await?;
            if found.as_array().is_some_and(|a| !a.is_empty()) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
        }
    }

    async fn query_selector_all(&mut self, selector: &str) -> Result<Vec<ElementHandle>, ScrapeError> {
        let value = self
            .command(
                Method::POST,
                "/execute/sync",
                Some(json!({ "script": OUTER_HTML_SCRIPT, "args": [selector] })),
            )
            .await?;
        let items = value
            .as_array()
            .ok_or_else(|| ScrapeError::Engine("outerHTML script did not return a list".into()))?;
        Ok(items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(|html| ElementHandle {
                outer_html: html.to_string(),
            })
            .collect())
    }

    async fn evaluate(&mut self, script: &str) -> Result<JsonValue, ScrapeError> {
        let expression = script.trim().trim_end_matches(';');
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": format!("return ({expression});"), "args": [] })),
        )
        .await
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        let Some(session_url) = self.session_url.take() else {
            return Ok(());
        };
        if let Err(err) = send(&self.client, Method::DELETE, session_url.clone(), None).await {
            warn!(session_url, error = %err, "failed to delete webdriver session");
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_carry_window_and_headless_flags() {
        let launcher = WebDriverLauncher::new(WebDriverConfig::default()).unwrap();
        let caps = launcher.capabilities();
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(args.iter().any(|a| a == "--window-size=1280,1024"));
        assert!(args.iter().any(|a| a == "--headless=new"));
        assert_eq!(caps["capabilities"]["alwaysMatch"]["timeouts"]["pageLoad"], 30_000);
    }

    #[test]
    fn session_cookies_carry_no_expiry() {
        let cookie = AuthCookie {
            name: "ct0".into(),
            value: "c".into(),
            domain: ".x.com".into(),
            path: "/".into(),
            expires: Some(-1.0),
            http_only: false,
            secure: true,
            same_site: Some("Lax".into()),
        };
        let payload = cookie_payload(&cookie);
        assert!(payload.get("expiry").is_none());
        assert_eq!(payload["sameSite"], "Lax");

        let persistent = AuthCookie {
            expires: Some(1767225600.9),
            ..cookie
        };
        assert_eq!(cookie_payload(&persistent)["expiry"], 1767225600u64);
    }
}
