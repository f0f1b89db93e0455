//! Browser-driven hashtag scraping: locator encoding, engine contracts,
//! per-tag scrape sessions and the batch scheduler that bounds them.

pub mod encoder;
pub mod engine;
pub mod extract;
pub mod fixture;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod webdriver;

use thiserror::Error;

pub use encoder::{flatten_tasks, EncodedCategory, ScrapeTask, TagCategory, TagLocator, TagUrlEncoder};
pub use engine::{AuthCookie, AuthState, BrowserEngine, BrowserLauncher, ElementHandle};
pub use extract::{EntryParser, ExtractionSelectors, ParsedPost};
pub use fixture::{FixtureLauncher, FixturePage, FixturePass};
pub use retry::{DelayRange, PixelRange, RetryPolicy};
pub use scheduler::{BatchScheduler, SchedulerConfig, TagScraper};
pub use session::{Scraper, ScrapeTimings, SessionConfig, SessionPhase, SessionReport};
pub use webdriver::{WebDriverConfig, WebDriverLauncher};

pub const CRATE_NAME: &str = "harvest-scrape";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("no content for {tag} after {attempts} attempts")]
    ContentNotFound { tag: String, attempts: u32 },
    #[error("browser engine error: {0}")]
    Engine(String),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("webdriver transport error: {0}")]
    Http(#[from] reqwest::Error),
}
