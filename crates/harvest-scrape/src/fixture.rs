//! Recorded result pages served through the [`BrowserEngine`] contract, for
//! offline runs and tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::engine::{AuthState, BrowserEngine, BrowserLauncher, ElementHandle};
use crate::ScrapeError;

/// What the page shows after a given number of scrolls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePass {
    #[serde(default)]
    pub articles: Vec<String>,
    /// Document height; `0` means `1000 * (pass index + 1)`.
    #[serde(default)]
    pub height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePage {
    pub locator: String,
    #[serde(default)]
    pub passes: Vec<FixturePass>,
    /// Page loads but the article selector never appears.
    #[serde(default)]
    pub withheld: bool,
    /// Navigation itself fails.
    #[serde(default)]
    pub unreachable: bool,
}

impl FixturePage {
    pub fn new(locator: impl Into<String>, passes: Vec<FixturePass>) -> Self {
        Self {
            locator: locator.into(),
            passes,
            ..Self::default()
        }
    }

    pub fn withheld(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            withheld: true,
            ..Self::default()
        }
    }

    fn height_at(&self, pass: usize) -> u64 {
        match self.passes.get(pass) {
            Some(p) if p.height > 0 => p.height,
            _ => 1000 * (pass as u64 + 1),
        }
    }
}

impl FixturePass {
    pub fn new(articles: Vec<String>) -> Self {
        Self { articles, height: 0 }
    }
}

/// Timeline-shaped article markup that the default extraction selectors understand.
pub fn article_markup(display_name: &str, handle: &str, datetime: &str, text: &str) -> String {
    format!(
        concat!(
            r#"<article role="article"><div data-testid="User-Name">"#,
            "<span>{name}</span><span>{name}</span><span>{handle}</span><span>·</span>",
            r#"<a href="/status"><time datetime="{datetime}">1h</time></a></div>"#,
            r#"<div data-testid="tweetText"><span>{text}</span></div></article>"#
        ),
        name = escape(display_name),
        handle = escape(handle),
        datetime = escape(datetime),
        text = escape(text),
    )
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Debug, Default)]
struct ContextGauge {
    open: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
}

impl ContextGauge {
    fn enter(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Many(Vec<FixturePage>),
    One(FixturePage),
}

/// Serves [`FixturePage`]s by exact locator and tracks how many contexts are open.
#[derive(Debug, Clone, Default)]
pub struct FixtureLauncher {
    pages: HashMap<String, Arc<FixturePage>>,
    gauge: Arc<ContextGauge>,
}

impl FixtureLauncher {
    pub fn new(pages: Vec<FixturePage>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .map(|p| (p.locator.clone(), Arc::new(p)))
                .collect(),
            gauge: Arc::default(),
        }
    }

    /// Every `*.json` file in `dir`, each holding one page or a list of pages.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading fixture dir {}", dir.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("listing fixture dir {}", dir.display()))?;
        paths.retain(|p| p.extension().is_some_and(|ext| ext == "json"));
        paths.sort();

        let mut pages = Vec::new();
        for path in paths {
            let data = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let file: FixtureFile =
                serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
            match file {
                FixtureFile::Many(many) => pages.extend(many),
                FixtureFile::One(one) => pages.push(one),
            }
        }
        debug!(dir = %dir.display(), pages = pages.len(), "loaded fixture pages");
        Ok(Self::new(pages))
    }

    pub fn open_contexts(&self) -> usize {
        self.gauge.open.load(Ordering::SeqCst)
    }

    pub fn peak_open_contexts(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> usize {
        self.gauge.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FixtureLauncher {
    async fn new_context(&self, _auth: Option<&AuthState>) -> Result<Box<dyn BrowserEngine>, ScrapeError> {
        self.gauge.enter();
        Ok(Box::new(FixtureEngine {
            pages: self.pages.clone(),
            gauge: Arc::clone(&self.gauge),
            current: None,
            pass: 0,
            closed: false,
        }))
    }
}

struct FixtureEngine {
    pages: HashMap<String, Arc<FixturePage>>,
    gauge: Arc<ContextGauge>,
    current: Option<Arc<FixturePage>>,
    pass: usize,
    closed: bool,
}

impl FixtureEngine {
    fn visible(&self) -> &[String] {
        match &self.current {
            Some(page) if !page.withheld => page
                .passes
                .get(self.pass)
                .map(|p| p.articles.as_slice())
                .unwrap_or_default(),
            _ => &[],
        }
    }
}

#[async_trait]
impl BrowserEngine for FixtureEngine {
    async fn navigate(&mut self, url: &str) -> Result<(), ScrapeError> {
        let page = self
            .pages
            .get(url)
            .filter(|p| !p.unreachable)
            .ok_or_else(|| ScrapeError::Navigation {
                url: url.to_string(),
                message: "no fixture page for locator".to_string(),
            })?;
        self.current = Some(Arc::clone(page));
        self.pass = 0;
        Ok(())
    }

    async fn wait_for_selector(&mut self, _selector: &str, timeout: Duration) -> Result<bool, ScrapeError> {
        if !self.visible().is_empty() {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        Ok(false)
    }

    async fn query_selector_all(&mut self, _selector: &str) -> Result<Vec<ElementHandle>, ScrapeError> {
        Ok(self
            .visible()
            .iter()
            .map(|html| ElementHandle {
                outer_html: html.clone(),
            })
            .collect())
    }

    async fn evaluate(&mut self, script: &str) -> Result<JsonValue, ScrapeError> {
        let Some(page) = self.current.clone() else {
            return Ok(JsonValue::Null);
        };
        if script.contains("scrollBy") {
            let last = page.passes.len().saturating_sub(1);
            self.pass = (self.pass + 1).min(last);
            return Ok(JsonValue::Null);
        }
        if script.contains("scrollHeight") {
            return Ok(JsonValue::from(page.height_at(self.pass)));
        }
        Ok(JsonValue::Null)
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        if !self.closed {
            self.closed = true;
            self.gauge.leave();
        }
        Ok(())
    }
}
