use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use harvest_core::{KeyVariant, LoadMode};
use harvest_scrape::encoder::SEARCH_URL_TEMPLATE;
use harvest_scrape::{DelayRange, SchedulerConfig, TagCategory};
use harvest_storage::TablePath;
use serde::Deserialize;
use tokio::fs;

pub const TAG_REGISTRY_FILE: &str = "tags.yaml";

/// `tags.yaml`: categories and their tags, scraped in file order.
#[derive(Debug, Clone, Deserialize)]
pub struct TagRegistry {
    pub categories: Vec<TagCategory>,
}

impl TagRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: TagRegistry = serde_yaml::from_str(text)?;
        if let Some(empty) = registry.categories.iter().find(|c| c.category.trim().is_empty()) {
            bail!("category with tags {:?} has no name", empty.tags);
        }
        Ok(registry)
    }

    pub fn tag_count(&self) -> usize {
        self.categories.iter().map(|c| c.tags.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub store_dir: PathBuf,
    pub repository: String,
    pub branch: String,
    pub table: String,
    pub key_variant: KeyVariant,
    pub webdriver_url: String,
    pub search_url_template: String,
    pub auth_state: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
    pub concurrency: usize,
    pub batch_cooldown_secs: u64,
    pub max_scrolls: Option<u32>,
    pub max_retries: u32,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub reports_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            store_dir: PathBuf::from("./lake"),
            repository: "tweets-repo".to_string(),
            branch: "main".to_string(),
            table: "tweets.parquet".to_string(),
            key_variant: KeyVariant::Full,
            webdriver_url: "http://localhost:4444".to_string(),
            search_url_template: SEARCH_URL_TEMPLATE.to_string(),
            auth_state: PathBuf::from("config/auth/twitter_auth.json"),
            fixtures_dir: None,
            concurrency: 3,
            batch_cooldown_secs: 30,
            max_scrolls: None,
            max_retries: 2,
            scheduler_enabled: false,
            sync_cron: "0 0/15 * * * *".to_string(),
            reports_enabled: true,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace_root = std::env::var("HARVEST_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        Self {
            store_dir: std::env::var("HARVEST_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("lake")),
            repository: std::env::var("HARVEST_REPOSITORY").unwrap_or(defaults.repository),
            branch: std::env::var("HARVEST_BRANCH").unwrap_or(defaults.branch),
            table: std::env::var("HARVEST_TABLE").unwrap_or(defaults.table),
            key_variant: match std::env::var("HARVEST_KEY_VARIANT").as_deref() {
                Ok("content_only") => KeyVariant::ContentOnly,
                _ => defaults.key_variant,
            },
            webdriver_url: std::env::var("WEBDRIVER_URL").unwrap_or(defaults.webdriver_url),
            search_url_template: std::env::var("HARVEST_SEARCH_URL")
                .unwrap_or(defaults.search_url_template),
            auth_state: std::env::var("HARVEST_AUTH_STATE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join(&defaults.auth_state)),
            fixtures_dir: std::env::var("HARVEST_FIXTURES_DIR").ok().map(PathBuf::from),
            concurrency: env_parse("HARVEST_CONCURRENCY").unwrap_or(defaults.concurrency),
            batch_cooldown_secs: env_parse("HARVEST_BATCH_COOLDOWN_SECS")
                .unwrap_or(defaults.batch_cooldown_secs),
            max_scrolls: env_parse("HARVEST_MAX_SCROLLS"),
            max_retries: env_parse("HARVEST_MAX_RETRIES").unwrap_or(defaults.max_retries),
            scheduler_enabled: env_flag("HARVEST_SCHEDULER_ENABLED").unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("HARVEST_SYNC_CRON").unwrap_or(defaults.sync_cron),
            reports_enabled: env_flag("HARVEST_REPORTS").unwrap_or(defaults.reports_enabled),
            workspace_root,
        }
    }

    pub fn table_path(&self) -> TablePath {
        TablePath::new(&self.repository, &self.branch, &self.table)
    }

    pub fn storage_namespace(&self) -> String {
        format!("local://{}", self.repository)
    }

    /// Sidecar key holding the last loaded batch fingerprint for this table.
    pub fn fingerprint_key(&self) -> String {
        format!("{}/{}/{}.fingerprint", self.repository, self.branch, self.table)
    }

    /// A full crawl on first load, a shallow one for the recurring top-up.
    pub fn max_scrolls_for(&self, mode: LoadMode) -> u32 {
        self.max_scrolls.unwrap_or(match mode {
            LoadMode::Initial => 15,
            LoadMode::Incremental => 2,
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.concurrency.max(1),
            cooldown: DelayRange::fixed(Duration::from_secs(self.batch_cooldown_secs)),
        }
    }

    pub fn tag_registry_path(&self) -> PathBuf {
        self.workspace_root.join(TAG_REGISTRY_FILE)
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}
