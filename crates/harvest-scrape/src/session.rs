use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use harvest_core::RawEntry;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::encoder::ScrapeTask;
use crate::engine::{AuthState, BrowserEngine, BrowserLauncher};
use crate::extract::{EntryParser, ExtractionSelectors};
use crate::retry::{DelayRange, PixelRange, RetryPolicy};
use crate::scheduler::TagScraper;
use crate::ScrapeError;

const SCROLL_HEIGHT_SCRIPT: &str = "document.body.scrollHeight";

/// Every wait a session performs. All of them are jittered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeTimings {
    pub post_navigation: DelayRange,
    pub content_retry: RetryPolicy,
    pub selector_timeout: Duration,
    pub scroll_distance: PixelRange,
    pub scroll_settle: DelayRange,
    pub height_settle: DelayRange,
}

impl Default for ScrapeTimings {
    fn default() -> Self {
        Self {
            post_navigation: DelayRange::secs(10.0, 20.0),
            content_retry: RetryPolicy::default(),
            selector_timeout: Duration::from_secs(5),
            scroll_distance: PixelRange { min: 2800, max: 3800 },
            scroll_settle: DelayRange::secs(10.0, 17.0),
            height_settle: DelayRange::secs(9.0, 14.0),
        }
    }
}

impl ScrapeTimings {
    /// No pauses at all; for recorded fixture pages.
    pub fn immediate() -> Self {
        Self {
            post_navigation: DelayRange::ZERO,
            content_retry: RetryPolicy {
                max_attempts: RetryPolicy::default().max_attempts,
                interval: DelayRange::ZERO,
            },
            selector_timeout: Duration::ZERO,
            scroll_distance: PixelRange { min: 2800, max: 3800 },
            scroll_settle: DelayRange::ZERO,
            height_settle: DelayRange::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub timings: ScrapeTimings,
    /// Upper bound on extraction passes. Scrolls happen between passes, so at
    /// most `max_scrolls - 1` of them; `0` and `1` read the first screen only.
    pub max_scrolls: u32,
    pub selectors: ExtractionSelectors,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timings: ScrapeTimings::default(),
            max_scrolls: 15,
            selectors: ExtractionSelectors::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Navigating,
    WaitingForContent,
    Extracting,
    Scrolling,
    Exhausted,
    Failed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Navigating => "navigating",
            SessionPhase::WaitingForContent => "waiting_for_content",
            SessionPhase::Extracting => "extracting",
            SessionPhase::Scrolling => "scrolling",
            SessionPhase::Exhausted => "exhausted",
            SessionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one tag. `entries` may be partial when `final_phase` is `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub task: ScrapeTask,
    pub entries: Vec<RawEntry>,
    pub final_phase: SessionPhase,
    pub failure: Option<String>,
    pub scrolls: u32,
    pub skipped_elements: usize,
    pub duplicates: usize,
}

impl SessionReport {
    fn new(task: &ScrapeTask) -> Self {
        Self {
            task: task.clone(),
            entries: Vec::new(),
            final_phase: SessionPhase::Navigating,
            failure: None,
            scrolls: 0,
            skipped_elements: 0,
            duplicates: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.final_phase == SessionPhase::Exhausted
    }

    fn fail(&mut self, err: &ScrapeError) {
        self.final_phase = SessionPhase::Failed;
        self.failure = Some(err.to_string());
    }
}

/// Drives one isolated browser context per tag through the scroll/extract loop.
pub struct Scraper {
    launcher: Arc<dyn BrowserLauncher>,
    auth: Option<Arc<AuthState>>,
    config: SessionConfig,
    parser: EntryParser,
}

impl Scraper {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        auth: Option<Arc<AuthState>>,
        config: SessionConfig,
    ) -> Result<Self, ScrapeError> {
        let parser = EntryParser::new(&config.selectors)?;
        Ok(Self {
            launcher,
            auth,
            config,
            parser,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Never fails: source trouble ends up in the report's phase and failure fields.
    pub async fn run(&self, task: &ScrapeTask) -> SessionReport {
        let span = info_span!("scrape_session", category = %task.category, tag = %task.tag);
        async move {
            let mut report = SessionReport::new(task);
            let mut engine = match self.launcher.new_context(self.auth.as_deref()).await {
                Ok(engine) => engine,
                Err(err) => {
                    warn!(error = %err, "could not open browser context");
                    report.fail(&err);
                    return report;
                }
            };

            if let Err(err) = self.drive(engine.as_mut(), &mut report).await {
                warn!(error = %err, phase = %report.final_phase, "scrape session failed");
                report.fail(&err);
            }
            if let Err(err) = engine.close().await {
                warn!(error = %err, "closing browser context failed");
            }

            info!(
                entries = report.entries.len(),
                scrolls = report.scrolls,
                duplicates = report.duplicates,
                skipped = report.skipped_elements,
                phase = %report.final_phase,
                "finished scraping tag"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, engine: &mut dyn BrowserEngine, report: &mut SessionReport) -> Result<(), ScrapeError> {
        let timings = &self.config.timings;
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut last_height: Option<u64> = None;
        let mut phase = SessionPhase::Navigating;

        loop {
            report.final_phase = phase;
            phase = match phase {
                SessionPhase::Navigating => {
                    engine.navigate(&report.task.locator).await?;
                    timings.post_navigation.pause().await;
                    SessionPhase::WaitingForContent
                }
                SessionPhase::WaitingForContent => {
                    let selector = self.parser.article_selector().to_string();
                    let timeout = timings.selector_timeout;
                    let found = timings
                        .content_retry
                        .until("wait_for_articles", engine, move |engine, attempt| {
                            let selector = selector.clone();
                            Box::pin(async move {
                                match engine.wait_for_selector(&selector, timeout).await {
                                    Ok(found) => found,
                                    Err(err) => {
                                        warn!(attempt, error = %err, "content probe errored");
                                        false
                                    }
                                }
                            })
                        })
                        .await;
                    match found {
                        Some(_) => SessionPhase::Extracting,
                        None if report.scrolls > 0 => {
                            warn!(scrolls = report.scrolls, "content vanished after scrolling, keeping what we have");
                            SessionPhase::Exhausted
                        }
                        None => {
                            return Err(ScrapeError::ContentNotFound {
                                tag: report.task.tag.clone(),
                                attempts: timings.content_retry.max_attempts.max(1),
                            })
                        }
                    }
                }
                SessionPhase::Extracting => {
                    self.extract(engine, report, &mut seen).await?;
                    SessionPhase::Scrolling
                }
                SessionPhase::Scrolling => {
                    if report.scrolls + 1 >= self.config.max_scrolls {
                        debug!(max_scrolls = self.config.max_scrolls, "pass budget exhausted");
                        SessionPhase::Exhausted
                    } else {
                        let before = match last_height {
                            Some(height) => height,
                            None => measure_height(engine).await?,
                        };
                        let distance = timings.scroll_distance.sample();
                        engine.evaluate(&format!("window.scrollBy(0, {distance})")).await?;
                        report.scrolls += 1;
                        timings.scroll_settle.pause().await;
                        let after = measure_height(engine).await?;
                        timings.height_settle.pause().await;
                        debug!(scroll = report.scrolls, distance, before, after, "scrolled");
                        if after == before {
                            debug!("reached bottom of page or no new content loaded");
                            SessionPhase::Exhausted
                        } else {
                            last_height = Some(after);
                            SessionPhase::WaitingForContent
                        }
                    }
                }
                SessionPhase::Exhausted | SessionPhase::Failed => return Ok(()),
            };
        }
    }

    async fn extract(
        &self,
        engine: &mut dyn BrowserEngine,
        report: &mut SessionReport,
        seen: &mut HashSet<(String, String)>,
    ) -> Result<(), ScrapeError> {
        let elements = engine.query_selector_all(self.parser.article_selector()).await?;
        let before = report.entries.len();
        for element in &elements {
            let Some(post) = self.parser.parse(&element.outer_html) else {
                report.skipped_elements += 1;
                continue;
            };
            let entry = RawEntry {
                category: report.task.category.clone(),
                tag: report.task.tag.clone(),
                username: post.username,
                text: post.text,
                post_time_raw: post.post_time_raw,
                scrape_time: Utc::now(),
            };
            if !seen.insert(entry.session_key()) {
                report.duplicates += 1;
                continue;
            }
            report.entries.push(entry);
        }
        debug!(
            elements = elements.len(),
            new_entries = report.entries.len() - before,
            "extracted pass"
        );
        Ok(())
    }
}

async fn measure_height(engine: &mut dyn BrowserEngine) -> Result<u64, ScrapeError> {
    let value = engine.evaluate(SCROLL_HEIGHT_SCRIPT).await?;
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|h| h as u64))
        .ok_or_else(|| ScrapeError::Engine(format!("scrollHeight returned {value}")))
}

#[async_trait]
impl TagScraper for Scraper {
    async fn scrape(&self, task: &ScrapeTask) -> SessionReport {
        self.run(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{article_markup, FixtureLauncher, FixturePage, FixturePass};

    fn task(locator: &str) -> ScrapeTask {
        ScrapeTask {
            category: "faculty".into(),
            tag: "#TU89".into(),
            locator: locator.into(),
        }
    }

    fn post(handle: &str, text: &str, minute: u32) -> String {
        article_markup(
            "Name",
            handle,
            &format!("2025-03-14T09:{minute:02}:00.000Z"),
            text,
        )
    }

    fn scraper(launcher: &FixtureLauncher, max_scrolls: u32) -> Scraper {
        Scraper::new(
            Arc::new(launcher.clone()),
            None,
            SessionConfig {
                timings: ScrapeTimings::default(),
                max_scrolls,
                selectors: ExtractionSelectors::default(),
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_posts_across_passes_collapse() {
        let launcher = FixtureLauncher::new(vec![FixturePage::new(
            "fixture://tu89",
            vec![
                FixturePass::new(vec![post("@a", "hello", 1), post("@b", "world", 2)]),
                FixturePass::new(vec![post("@b", "world", 2), post("@a", "hello", 7), post("@c", "new", 3)]),
            ],
        )]);
        let report = scraper(&launcher, 10).run(&task("fixture://tu89")).await;

        assert!(report.succeeded());
        assert_eq!(report.final_phase, SessionPhase::Exhausted);
        let pairs = report
            .entries
            .iter()
            .map(|e| (e.username.as_str(), e.text.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![("@a", "hello"), ("@b", "world"), ("@c", "new")]);
        assert_eq!(report.duplicates, 2);
        assert_eq!(launcher.open_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_budget_caps_passes() {
        let passes = (0..5)
            .map(|i| FixturePass::new(vec![post(&format!("@u{i}"), "t", i)]))
            .collect();
        let launcher = FixtureLauncher::new(vec![FixturePage::new("fixture://long", passes)]);
        let report = scraper(&launcher, 2).run(&task("fixture://long")).await;

        assert_eq!(report.scrolls, 1);
        assert_eq!(report.entries.len(), 2);
        assert!(report.succeeded());

        let report = scraper(&launcher, 1).run(&task("fixture://long")).await;
        assert_eq!(report.scrolls, 0);
        assert_eq!(report.entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn withheld_content_fails_after_retries() {
        let launcher = FixtureLauncher::new(vec![FixturePage::withheld("fixture://quiet")]);
        let started = tokio::time::Instant::now();
        let report = scraper(&launcher, 5).run(&task("fixture://quiet")).await;

        assert_eq!(report.final_phase, SessionPhase::Failed);
        assert!(report.entries.is_empty());
        assert!(report.failure.as_deref().unwrap_or_default().contains("after 2 attempts"));
        assert!(started.elapsed() >= Duration::from_secs(10 + 5 + 10 + 5));
        assert_eq!(launcher.open_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_locator_is_contained() {
        let launcher = FixtureLauncher::new(vec![]);
        let report = scraper(&launcher, 5).run(&task("fixture://nowhere")).await;
        assert_eq!(report.final_phase, SessionPhase::Failed);
        assert!(report.failure.unwrap().contains("navigation"));
        assert_eq!(launcher.open_contexts(), 0);
    }

    #[test]
    fn immediate_timings_keep_retry_budget() {
        let t = ScrapeTimings::immediate();
        assert_eq!(t.content_retry.max_attempts, 2);
        assert_eq!(t.post_navigation.sample(), Duration::ZERO);
    }
}
