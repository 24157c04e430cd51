//! Background prefetching used by predictive cache warming.

use async_trait::async_trait;
use serde_json::Value;
use tether_core::FetchError;
use tokio::task::JoinHandle;

use crate::strategy::CacheStrategy;

/// One data type to load for a predicted destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchRequest {
    pub user_id: String,
    pub route: String,
    pub data_type: String,
}

impl PrefetchRequest {
    /// Default cache key for warmed data: `data_type:user_id:route`.
    pub fn default_cache_key(&self) -> String {
        format!("{}:{}:{}", self.data_type, self.user_id, self.route)
    }
}

/// Loads data for a route ahead of navigation.
#[async_trait]
pub trait Prefetcher: Send + Sync + 'static {
    async fn prefetch(&self, request: &PrefetchRequest) -> Result<Value, FetchError>;

    /// Cache key the prefetched value is stored under.
    fn cache_key(&self, request: &PrefetchRequest) -> String {
        request.default_cache_key()
    }
}

/// A single warming job that was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmingTarget {
    pub route: String,
    pub data_type: String,
    pub cache_key: String,
    pub strategy: CacheStrategy,
}

/// Why a candidate was not warmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NetworkOnly,
    AlreadyCached,
    /// Called outside a tokio runtime, so no background job could start.
    NoRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTarget {
    pub route: String,
    pub data_type: String,
    pub reason: SkipReason,
}

/// Outcome of the warming jobs once they have finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmingReport {
    pub warmed: usize,
    pub failed: usize,
}

/// What [`warm_cache_intelligently`](crate::CacheCoordinator::warm_cache_intelligently)
/// decided to do. Jobs run in the background; [`wait`](Self::wait) joins them.
#[derive(Debug, Default)]
pub struct WarmingPlan {
    pub predicted_routes: Vec<String>,
    pub targets: Vec<WarmingTarget>,
    pub skipped: Vec<SkippedTarget>,
    jobs: Vec<JoinHandle<bool>>,
}

impl WarmingPlan {
    pub(crate) fn new(predicted_routes: Vec<String>) -> Self {
        Self {
            predicted_routes,
            ..Self::default()
        }
    }

    pub(crate) fn push_job(&mut self, target: WarmingTarget, job: JoinHandle<bool>) {
        self.targets.push(target);
        self.jobs.push(job);
    }

    pub(crate) fn skip(&mut self, route: &str, data_type: &str, reason: SkipReason) {
        self.skipped.push(SkippedTarget {
            route: route.to_string(),
            data_type: data_type.to_string(),
            reason,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Wait for every warming job. Aborted or panicked jobs count as failed.
    pub async fn wait(self) -> WarmingReport {
        let mut report = WarmingReport::default();
        for job in self.jobs {
            match job.await {
                Ok(true) => report.warmed += 1,
                _ => report.failed += 1,
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_key() {
        let request = PrefetchRequest {
            user_id: "u1".to_string(),
            route: "/courses".to_string(),
            data_type: "courses".to_string(),
        };
        assert_eq!(request.default_cache_key(), "courses:u1:/courses");
    }

    #[tokio::test]
    async fn test_wait_counts_outcomes() {
        let mut plan = WarmingPlan::new(vec!["/a".to_string()]);
        let target = |data_type: &str| WarmingTarget {
            route: "/a".to_string(),
            data_type: data_type.to_string(),
            cache_key: data_type.to_string(),
            strategy: CacheStrategy::CacheFirst,
        };
        plan.push_job(target("ok"), tokio::spawn(async { true }));
        plan.push_job(target("bad"), tokio::spawn(async { false }));

        assert_eq!(plan.targets.len(), 2);
        let report = plan.wait().await;
        assert_eq!(report, WarmingReport { warmed: 1, failed: 1 });
    }
}
