use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::ScrapeError;

/// CSS selectors for the result-page markup. Defaults follow the live search timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSelectors {
    pub article: String,
    pub author: String,
    pub time: String,
    pub text: String,
}

impl Default for ExtractionSelectors {
    fn default() -> Self {
        Self {
            article: "article".to_string(),
            author: "[data-testid='User-Name']".to_string(),
            time: "time".to_string(),
            text: "[data-testid='tweetText']".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPost {
    pub username: String,
    pub text: String,
    pub post_time_raw: String,
}

/// Compiled selectors that lift one post out of an article's outer HTML.
#[derive(Debug, Clone)]
pub struct EntryParser {
    article: String,
    author: Selector,
    span: Selector,
    time: Selector,
    text: Selector,
}

fn compile(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|err| ScrapeError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

impl EntryParser {
    pub fn new(selectors: &ExtractionSelectors) -> Result<Self, ScrapeError> {
        Ok(Self {
            article: selectors.article.clone(),
            author: compile(&selectors.author)?,
            span: compile("span")?,
            time: compile(&selectors.time)?,
            text: compile(&selectors.text)?,
        })
    }

    /// Selector the engine should match whole posts with.
    pub fn article_selector(&self) -> &str {
        &self.article
    }

    /// `None` when any of handle, text or timestamp is missing or blank.
    pub fn parse(&self, outer_html: &str) -> Option<ParsedPost> {
        let fragment = Html::parse_fragment(outer_html);
        let author = fragment.select(&self.author).next()?;

        let username = self.handle(author)?;
        let post_time_raw = author
            .select(&self.time)
            .chain(fragment.select(&self.time))
            .find_map(|el| el.value().attr("datetime"))
            .map(str::trim)
            .filter(|v| !v.is_empty())?
            .to_string();
        let text = fragment
            .select(&self.text)
            .next()
            .map(|el| el.text().collect::<String>())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())?;

        Some(ParsedPost {
            username,
            text,
            post_time_raw,
        })
    }

    /// The `@handle` span wins. Without one, fall back to the positional layout:
    /// third span when the block has exactly four, fourth otherwise.
    fn handle(&self, author: ElementRef<'_>) -> Option<String> {
        let spans = author
            .select(&self.span)
            .map(|s| s.text().collect::<String>().trim().to_string())
            .collect::<Vec<_>>();
        if let Some(handle) = spans.iter().find(|s| s.starts_with('@') && s.len() > 1) {
            return Some(handle.clone());
        }
        if spans.len() <= 3 {
            return None;
        }
        let positional = if spans.len() == 4 { &spans[2] } else { &spans[3] };
        Some(positional.clone()).filter(|s| !s.is_empty())
    }
}
