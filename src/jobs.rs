//! Batch job triggers
//!
//! The heatmap and isTop artifacts are regenerated by an external job host;
//! this module owns the trigger calls and their caching contract: a heatmap
//! trigger landing inside the cooling window is skipped, so periodic and
//! externally forced triggers cannot stampede the job host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::Result;

/// Collaborator interface to the external batch job host. Internals of the
/// jobs themselves are out of scope here.
#[async_trait]
pub trait BatchJobs: Send + Sync {
    async fn regenerate_heatmap(&self) -> Result<()>;
    async fn recompute_is_top(&self) -> Result<()>;
}

/// Stub job host for deployments without one; logs and succeeds.
pub struct LoggingBatchJobs;

#[async_trait]
impl BatchJobs for LoggingBatchJobs {
    async fn regenerate_heatmap(&self) -> Result<()> {
        info!("Heatmap regeneration triggered");
        Ok(())
    }

    async fn recompute_is_top(&self) -> Result<()> {
        info!("isTop recomputation triggered");
        Ok(())
    }
}

pub struct JobScheduler {
    jobs: Arc<dyn BatchJobs>,
    cooling_window: Duration,
    last_heatmap: Mutex<Option<Instant>>,
}

impl JobScheduler {
    pub fn new(jobs: Arc<dyn BatchJobs>, cooling_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            cooling_window,
            last_heatmap: Mutex::new(None),
        })
    }

    /// Trigger a heatmap regeneration unless one ran inside the cooling
    /// window. Returns whether the job was actually invoked.
    pub async fn trigger_heatmap(&self) -> Result<bool> {
        let mut last = self.last_heatmap.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.cooling_window {
                debug!(
                    "Heatmap trigger skipped, last run {:?} ago",
                    at.elapsed()
                );
                return Ok(false);
            }
        }
        self.jobs.regenerate_heatmap().await?;
        *last = Some(Instant::now());
        Ok(true)
    }

    /// isTop recomputation has no cooling window; it is always forwarded.
    pub async fn trigger_is_top(&self) -> Result<()> {
        self.jobs.recompute_is_top().await
    }

    /// Periodic trigger loop; the cooling window also paces this timer's
    /// firings after missed ticks.
    pub fn start(self: Arc<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.trigger_heatmap().await {
                    error!("Periodic heatmap trigger failed: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJobs {
        heatmaps: AtomicUsize,
    }

    #[async_trait]
    impl BatchJobs for CountingJobs {
        async fn regenerate_heatmap(&self) -> Result<()> {
            self.heatmaps.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn recompute_is_top(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn repeated_triggers_inside_window_are_skipped() {
        let jobs = Arc::new(CountingJobs {
            heatmaps: AtomicUsize::new(0),
        });
        let scheduler = JobScheduler::new(jobs.clone(), Duration::from_secs(60));

        assert!(scheduler.trigger_heatmap().await.unwrap());
        assert!(!scheduler.trigger_heatmap().await.unwrap());
        assert_eq!(jobs.heatmaps.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn triggers_run_again_after_window() {
        let jobs = Arc::new(CountingJobs {
            heatmaps: AtomicUsize::new(0),
        });
        let scheduler = JobScheduler::new(jobs.clone(), Duration::from_millis(10));

        assert!(scheduler.trigger_heatmap().await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.trigger_heatmap().await.unwrap());
        assert_eq!(jobs.heatmaps.load(Ordering::Relaxed), 2);
    }
}
