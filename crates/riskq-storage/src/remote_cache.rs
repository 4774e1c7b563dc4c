//! Background-refreshed local cache of remote report exports.
//!
//! Each report type keeps one [`RemoteCacheEntry`] pointing at a local copy of
//! the newest matching remote object. Copies are written under
//! `{cache_dir}/{report_type}/{timestamp}-{uuid}/` through a temporary file and an
//! atomic rename, so a reader always sees a complete file. Entries are
//! swapped whole once the copy is in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use parking_lot::{Mutex, RwLock};
use riskq_core::{
    CacheConfig, RemoteConfig, ReportType, RetryConfig, RiskError, RiskResult,
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::{ReportCatalog, ReportNaming};

/// Local copy of the newest remote object of one report type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCacheEntry {
    pub report_type: ReportType,
    pub remote_key: String,
    pub local_copy: PathBuf,
    pub fetched_at: DateTime<Utc>,
    pub remote_last_modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub etag: Option<String>,
}

impl RemoteCacheEntry {
    /// Whether this entry already holds the given remote object.
    fn describes(&self, meta: &ObjectMeta) -> bool {
        self.remote_key == meta.location.as_ref()
            && self.size_bytes == meta.size as u64
            && self.remote_last_modified == meta.last_modified
            && self.etag == meta.e_tag
    }
}

/// Result of a refresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new copy was downloaded and swapped in.
    Downloaded(RemoteCacheEntry),
    /// The newest remote object is already cached.
    Unchanged,
    /// Another refresh of the same report type is running.
    AlreadyInFlight,
}

/// Refresh-on-schedule cache over an S3-compatible object store.
pub struct RemoteRefreshCache {
    store: Arc<dyn ObjectStore>,
    prefix: Option<ObjectPath>,
    cache_dir: PathBuf,
    catalog: Arc<ReportCatalog>,
    report_types: Vec<ReportType>,
    interval: Duration,
    retry: RetryConfig,
    entries: RwLock<HashMap<ReportType, RemoteCacheEntry>>,
    last_errors: RwLock<HashMap<ReportType, String>>,
    in_flight: Mutex<HashMap<ReportType, Arc<tokio::sync::Mutex<()>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteRefreshCache {
    /// Creates an empty cache refreshing every report type of `catalog`.
    pub fn new(store: Arc<dyn ObjectStore>, catalog: Arc<ReportCatalog>, config: &CacheConfig) -> Self {
        let report_types = catalog.report_types().cloned().collect();
        Self {
            store,
            prefix: None,
            cache_dir: config.dir.clone(),
            catalog,
            report_types,
            interval: config.refresh_interval(),
            retry: config.retry.clone(),
            entries: RwLock::new(HashMap::new()),
            last_errors: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Restricts listing to keys under `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix
            .map(|p| p.trim().trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(ObjectPath::from);
        self
    }

    /// Replaces the set of report types refreshed by the background workers.
    #[must_use]
    pub fn with_report_types(mut self, report_types: Vec<ReportType>) -> Self {
        self.report_types = report_types;
        self
    }

    pub fn report_types(&self) -> &[ReportType] {
        &self.report_types
    }

    pub fn refresh_interval(&self) -> Duration {
        self.interval
    }

    /// Current entry for a report type.
    ///
    /// Fails with `UpstreamUnavailable` until a fetch for the type succeeded.
    /// A later failed refresh keeps the previous entry available.
    pub fn current(&self, report_type: &ReportType) -> RiskResult<RemoteCacheEntry> {
        if let Some(entry) = self.entries.read().get(report_type) {
            return Ok(entry.clone());
        }

        let message = self
            .last_errors
            .read()
            .get(report_type)
            .cloned()
            .unwrap_or_else(|| "no successful fetch yet".to_string());
        Err(RiskError::upstream_unavailable(report_type.as_str(), message))
    }

    /// Fetches the newest remote object of a report type if it changed.
    pub async fn refresh(&self, report_type: &ReportType) -> RiskResult<RefreshOutcome> {
        let lock = self.flight_lock(report_type);
        let Ok(_guard) = lock.try_lock() else {
            debug!(report_type = %report_type, "Refresh already in flight");
            return Ok(RefreshOutcome::AlreadyInFlight);
        };

        match self.refresh_locked(report_type).await {
            Ok(outcome) => {
                self.last_errors.write().remove(report_type);
                Ok(outcome)
            }
            Err(e) => {
                self.last_errors
                    .write()
                    .insert(report_type.clone(), e.to_string());
                Err(e)
            }
        }
    }

    async fn refresh_locked(&self, report_type: &ReportType) -> RiskResult<RefreshOutcome> {
        let naming = self.catalog.naming(report_type)?;
        let meta = self.newest_object(&naming).await?.ok_or_else(|| {
            RiskError::upstream_unavailable(
                report_type.as_str(),
                format!("no object matching {} under prefix", naming.prefix()),
            )
        })?;

        if let Some(current) = self.entries.read().get(report_type) {
            if current.describes(&meta) {
                debug!(report_type = %report_type, key = %meta.location, "Remote report unchanged");
                return Ok(RefreshOutcome::Unchanged);
            }
        }

        let entry = self.download(report_type, &meta).await?;
        let previous = self
            .entries
            .write()
            .insert(report_type.clone(), entry.clone());

        info!(
            report_type = %report_type,
            key = %entry.remote_key,
            size_bytes = entry.size_bytes,
            "Remote report refreshed"
        );

        if let Some(previous) = previous {
            self.prune_versions(report_type, &entry, &previous).await;
        }

        Ok(RefreshOutcome::Downloaded(entry))
    }

    /// Newest object matching the naming rule, by last-modified then key.
    async fn newest_object(&self, naming: &ReportNaming) -> RiskResult<Option<ObjectMeta>> {
        let mut listing = self.store.list(self.prefix.as_ref());
        let mut newest: Option<ObjectMeta> = None;

        while let Some(item) = listing.next().await {
            let meta = item.map_err(|e| {
                RiskError::upstream_unavailable(
                    naming.report_type().as_str(),
                    format!("failed to list objects: {e}"),
                )
            })?;

            let matches = meta
                .location
                .filename()
                .and_then(|name| naming.match_file_name(name))
                .is_some();
            if !matches {
                continue;
            }

            newest = match newest {
                Some(best)
                    if (best.last_modified, best.location.as_ref())
                        >= (meta.last_modified, meta.location.as_ref()) =>
                {
                    Some(best)
                }
                _ => Some(meta),
            };
        }

        Ok(newest)
    }

    async fn download(
        &self,
        report_type: &ReportType,
        meta: &ObjectMeta,
    ) -> RiskResult<RemoteCacheEntry> {
        let upstream = |e: object_store::Error| {
            RiskError::upstream_unavailable(
                report_type.as_str(),
                format!("failed to fetch {}: {e}", meta.location),
            )
        };

        let file_name = meta
            .location
            .filename()
            .ok_or_else(|| RiskError::internal(format!("object key has no file name: {}", meta.location)))?;
        let version_dir = self
            .cache_dir
            .join(report_type.as_str())
            .join(version_name(meta));
        tokio::fs::create_dir_all(&version_dir).await?;

        let target = version_dir.join(file_name);
        let partial = version_dir.join(format!(".{file_name}.{}.part", Uuid::new_v4()));
        let written = match self.stream_to(&meta.location, &partial).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                let _ = tokio::fs::remove_dir(&version_dir).await;
                return Err(match e {
                    StreamError::Store(e) => upstream(e),
                    StreamError::Io(e) => e.into(),
                });
            }
        };
        tokio::fs::rename(&partial, &target).await?;

        Ok(RemoteCacheEntry {
            report_type: report_type.clone(),
            remote_key: meta.location.to_string(),
            local_copy: target,
            fetched_at: Utc::now(),
            remote_last_modified: meta.last_modified,
            size_bytes: written,
            etag: meta.e_tag.clone(),
        })
    }

    /// Copies an object chunk by chunk into `path`, returning the byte count.
    async fn stream_to(&self, location: &ObjectPath, path: &Path) -> Result<u64, StreamError> {
        let mut chunks = self.store.get(location).await?.into_stream();
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Removes cached versions older than the previous one.
    ///
    /// The previous copy is kept because in-flight requests may still read it.
    async fn prune_versions(
        &self,
        report_type: &ReportType,
        current: &RemoteCacheEntry,
        previous: &RemoteCacheEntry,
    ) {
        let keep = [version_dir_of(&current.local_copy), version_dir_of(&previous.local_copy)];
        let type_dir = self.cache_dir.join(report_type.as_str());

        let mut dirs = match tokio::fs::read_dir(&type_dir).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(report_type = %report_type, error = %e, "Failed to list cache versions");
                return;
            }
        };

        while let Ok(Some(dir)) = dirs.next_entry().await {
            let path = dir.path();
            if keep.iter().any(|k| k.as_deref() == Some(path.as_path())) {
                continue;
            }
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to prune cache version");
            } else {
                debug!(path = %path.display(), "Pruned cache version");
            }
        }
    }

    pub(crate) fn flight_lock(&self, report_type: &ReportType) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.in_flight
                .lock()
                .entry(report_type.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Start one background refresh worker per report type.
    ///
    /// Each worker refreshes immediately, then every refresh interval. A failed
    /// attempt is retried with exponential backoff, capped at the interval.
    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("Remote refresh workers already running");
            return;
        }

        for report_type in &self.report_types {
            let cache = Arc::clone(self);
            let report_type = report_type.clone();
            workers.push(tokio::spawn(async move {
                cache.run_worker(report_type).await;
            }));
        }

        info!(
            report_types = self.report_types.len(),
            "Remote refresh workers started (interval: {:?})", self.interval
        );
    }

    async fn run_worker(&self, report_type: ReportType) {
        let mut failures: u32 = 0;

        loop {
            let delay = match self.refresh(&report_type).await {
                Ok(_) => {
                    failures = 0;
                    self.interval
                }
                Err(e) => {
                    let delay = self.retry_delay(failures);
                    failures = failures.saturating_add(1);
                    error!(
                        report_type = %report_type,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Remote refresh failed"
                    );
                    delay
                }
            };

            tokio::time::sleep(delay).await;
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    fn retry_delay(&self, failures: u32) -> Duration {
        if failures >= self.retry.max_attempts {
            self.interval
        } else {
            self.retry.backoff_for_attempt(failures).min(self.interval)
        }
    }

    /// Stops the background workers.
    pub fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            handle.abort();
        }
        info!("Remote refresh workers shut down");
    }
}

enum StreamError {
    Store(object_store::Error),
    Io(std::io::Error),
}

impl From<object_store::Error> for StreamError {
    fn from(e: object_store::Error) -> Self {
        StreamError::Store(e)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Io(e)
    }
}

/// Version directory name: remote timestamp plus a unique suffix.
///
/// Two objects can share a last-modified second, so the timestamp alone would
/// let a new download overwrite a copy that readers still hold.
fn version_name(meta: &ObjectMeta) -> String {
    format!(
        "{}-{}",
        meta.last_modified.format("%Y%m%dT%H%M%S%.3fZ"),
        Uuid::new_v4().simple()
    )
}

fn version_dir_of(local_copy: &Path) -> Option<PathBuf> {
    local_copy.parent().map(Path::to_path_buf)
}

/// Builds the S3-compatible object store described by `config`.
pub fn build_object_store(config: &RemoteConfig) -> RiskResult<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::new()
        .with_region(&config.region)
        .with_bucket_name(&config.bucket);

    if let Some(key) = &config.access_key_id {
        builder = builder.with_access_key_id(key);
    }
    if let Some(secret) = &config.secret_access_key {
        builder = builder.with_secret_access_key(secret);
    }

    // Custom endpoint for MinIO or other S3-compatible stores
    if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        builder = builder.with_endpoint(endpoint);
        if endpoint.starts_with("http://") {
            builder = builder.with_allow_http(true);
        }
    }
    if config.allow_http {
        builder = builder.with_allow_http(true);
    }

    let store = builder
        .build()
        .map_err(|e| RiskError::internal(format!("Failed to create S3 client: {e}")))?;

    Ok(Arc::new(store))
}
