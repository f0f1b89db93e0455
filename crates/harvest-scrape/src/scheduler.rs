use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::encoder::ScrapeTask;
use crate::retry::DelayRange;
use crate::session::SessionReport;

/// Anything that turns one task into a session report without failing.
#[async_trait]
pub trait TagScraper: Send + Sync {
    async fn scrape(&self, task: &ScrapeTask) -> SessionReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub cooldown: DelayRange,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            cooldown: DelayRange::fixed(Duration::from_secs(30)),
        }
    }
}

/// Runs tasks in consecutive groups of `concurrency`, cooling down between groups.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    config: SchedulerConfig,
    gate: Arc<Semaphore>,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            config: SchedulerConfig {
                concurrency,
                ..config
            },
            gate: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One report per task, in submission order.
    pub async fn run<S>(&self, scraper: &S, tasks: Vec<ScrapeTask>) -> Vec<SessionReport>
    where
        S: TagScraper + ?Sized,
    {
        let total = tasks.len();
        let batches = tasks.chunks(self.config.concurrency).collect::<Vec<_>>();
        let batch_count = batches.len();
        let mut reports = Vec::with_capacity(total);

        for (index, batch) in batches.into_iter().enumerate() {
            info!(
                batch = index + 1,
                batches = batch_count,
                size = batch.len(),
                "starting scrape batch"
            );
            let results = join_all(batch.iter().map(|task| self.gated(scraper, task))).await;
            let failed = results.iter().filter(|r| !r.succeeded()).count();
            if failed > 0 {
                warn!(batch = index + 1, failed, "some tags came back empty or partial");
            }
            reports.extend(results);

            if index + 1 < batch_count {
                let wait = self.config.cooldown.sample();
                info!(wait_secs = wait.as_secs_f64(), "cooling down before next batch");
                tokio::time::sleep(wait).await;
            }
        }

        info!(
            tags = total,
            entries = reports.iter().map(|r| r.entries.len()).sum::<usize>(),
            "all scrape batches finished"
        );
        reports
    }

    async fn gated<S>(&self, scraper: &S, task: &ScrapeTask) -> SessionReport
    where
        S: TagScraper + ?Sized,
    {
        // Never closed, so `acquire` cannot fail here.
        let _permit = self.gate.acquire().await.ok();
        scraper.scrape(task).await
    }
}
