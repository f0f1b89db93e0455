use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const SEARCH_URL_TEMPLATE: &str = "https://x.com/search?q={query}&src=typed_query&f=live";

/// One registry entry: a category and its tags, in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCategory {
    pub category: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagLocator {
    pub tag: String,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedCategory {
    pub category: String,
    pub locators: Vec<TagLocator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub category: String,
    pub tag: String,
    pub locator: String,
}

#[derive(Debug, Clone)]
pub struct TagUrlEncoder {
    template: String,
}

impl Default for TagUrlEncoder {
    fn default() -> Self {
        Self::new(SEARCH_URL_TEMPLATE)
    }
}

impl TagUrlEncoder {
    /// `template` must contain a `{query}` placeholder.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn encode_tag(&self, tag: &str) -> String {
        self.template.replace("{query}", &urlencoding::encode(tag))
    }

    /// Category and tag order are preserved; a tag repeated within one category keeps its first slot.
    pub fn encode(&self, categories: &[TagCategory]) -> Vec<EncodedCategory> {
        let encoded = categories
            .iter()
            .map(|entry| {
                let mut locators: Vec<TagLocator> = Vec::with_capacity(entry.tags.len());
                for (i, tag) in entry.tags.iter().enumerate() {
                    if locators.iter().any(|l| &l.tag == tag) {
                        continue;
                    }
                    debug!(
                        category = %entry.category,
                        "encoded tag {}/{}: {}",
                        i + 1,
                        entry.tags.len(),
                        tag
                    );
                    locators.push(TagLocator {
                        tag: tag.clone(),
                        locator: self.encode_tag(tag),
                    });
                }
                EncodedCategory {
                    category: entry.category.clone(),
                    locators,
                }
            })
            .collect::<Vec<_>>();
        info!(categories = encoded.len(), "encoded tags to search locators");
        encoded
    }
}

pub fn flatten_tasks(encoded: &[EncodedCategory]) -> Vec<ScrapeTask> {
    encoded
        .iter()
        .flat_map(|cat| {
            cat.locators.iter().map(|l| ScrapeTask {
                category: cat.category.clone(),
                tag: l.tag.clone(),
                locator: l.locator.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashtags_are_fully_percent_encoded() {
        let encoder = TagUrlEncoder::default();
        assert_eq!(
            encoder.encode_tag("#TU89"),
            "https://x.com/search?q=%23TU89&src=typed_query&f=live"
        );
        assert_eq!(
            encoder.encode_tag("TU lang:th"),
            "https://x.com/search?q=TU%20lang%3Ath&src=typed_query&f=live"
        );
        assert_eq!(
            encoder.encode_tag("#มธ"),
            "https://x.com/search?q=%23%E0%B8%A1%E0%B8%98&src=typed_query&f=live"
        );
    }

    #[test]
    fn order_is_preserved_through_flattening() {
        let registry = vec![
            TagCategory {
                category: "b-category".into(),
                tags: vec!["#z".into(), "#a".into(), "#z".into()],
            },
            TagCategory {
                category: "a-category".into(),
                tags: vec!["#m".into()],
            },
        ];
        let encoded = TagUrlEncoder::default().encode(&registry);
        assert_eq!(encoded[0].category, "b-category");
        assert_eq!(encoded[0].locators.len(), 2);

        let tasks = flatten_tasks(&encoded);
        let order = tasks.iter().map(|t| t.tag.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["#z", "#a", "#m"]);
        assert_eq!(tasks[2].category, "a-category");
    }

    #[test]
    fn custom_template_is_honoured() {
        let encoder = TagUrlEncoder::new("http://localhost/search/{query}");
        assert_eq!(encoder.encode_tag("a b"), "http://localhost/search/a%20b");
    }
}
