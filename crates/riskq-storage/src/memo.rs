use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache as MokaCache;
use riskq_core::{ReportFile, ReportType, RiskError, RiskResult};

/// Memoized resolution of one report type.
#[derive(Debug, Clone)]
pub struct MemoEntry {
    pub file: Arc<ReportFile>,
    pub observed_at: DateTime<Utc>,
}

/// Time-bounded memo of the latest file per report type.
///
/// Resolution for a report type is single-flight: concurrent callers that
/// miss the memo wait for one resolver and share its result. Failures are
/// handed to every waiter and never memoized.
#[derive(Clone)]
pub struct LatestFileMemo {
    cache: MokaCache<ReportType, MemoEntry>,
    ttl: Duration,
}

impl LatestFileMemo {
    pub fn new(ttl: Duration) -> Self {
        let cache = MokaCache::builder().time_to_live(ttl).build();
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the memoized file, running `resolve` on a miss.
    pub async fn get_or_resolve<F>(
        &self,
        report_type: &ReportType,
        resolve: F,
    ) -> RiskResult<Arc<ReportFile>>
    where
        F: Future<Output = RiskResult<ReportFile>>,
    {
        if let Some(entry) = self.cache.get(report_type).await {
            tracing::debug!(
                report_type = %report_type,
                content_hash = %entry.file.content_hash,
                "Latest file memo hit"
            );
            return Ok(entry.file);
        }

        self.cache
            .try_get_with(report_type.clone(), async move {
                let file = resolve.await?;
                Ok::<_, RiskError>(MemoEntry {
                    file: Arc::new(file),
                    observed_at: Utc::now(),
                })
            })
            .await
            .map(|entry| entry.file)
            .map_err(RiskError::from_shared)
    }

    /// Current memo entry, if fresh.
    pub async fn get(&self, report_type: &ReportType) -> Option<MemoEntry> {
        self.cache.get(report_type).await
    }

    pub async fn invalidate(&self, report_type: &ReportType) {
        self.cache.invalidate(report_type).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
