//! Report Locator
//!
//! Resolves the authoritative file of a report type. A configured local
//! folder always wins; otherwise the locator reads the current entry of the
//! remote refresh cache. Resolutions are memoized per report type for a short
//! TTL and identified by content hash. Report families resolve every member
//! and are identified by the digest of the member hashes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::NaiveDateTime;
use riskq_core::{
    ReportFile, ReportSnapshot, ReportType, RiskError, RiskResult, RiskqConfig, SnapshotMember,
};
use tracing::{debug, info};

use crate::catalog::{ReportCatalog, ReportNaming};
use crate::hashing::{combined_hash, observe_file_async};
use crate::memo::LatestFileMemo;
use crate::remote_cache::{build_object_store, RemoteRefreshCache};

/// Which backend a locator reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Remote,
}

enum Source {
    Local(PathBuf),
    Remote(Arc<RemoteRefreshCache>),
}

pub struct ReportLocator {
    source: Source,
    catalog: Arc<ReportCatalog>,
    memo: LatestFileMemo,
}

impl ReportLocator {
    /// Locator over a locally synced folder.
    pub fn local(folder: impl Into<PathBuf>, catalog: Arc<ReportCatalog>, memo: LatestFileMemo) -> Self {
        Self {
            source: Source::Local(folder.into()),
            catalog,
            memo,
        }
    }

    /// Locator over the remote refresh cache.
    pub fn remote(cache: Arc<RemoteRefreshCache>, catalog: Arc<ReportCatalog>, memo: LatestFileMemo) -> Self {
        Self {
            source: Source::Remote(cache),
            catalog,
            memo,
        }
    }

    /// Builds the locator described by the configuration.
    ///
    /// Remote mode builds the object store and the refresh cache but does not
    /// start its workers.
    pub fn from_config(config: &RiskqConfig) -> RiskResult<Self> {
        let catalog = Arc::new(
            ReportCatalog::with_overrides(&config.report_types)?.with_families(&config.families)?,
        );
        let memo = LatestFileMemo::new(config.cache.latest_file_ttl());

        if let Some(folder) = config.source.local_path() {
            info!(folder = %folder.display(), "Using local report folder");
            return Ok(Self::local(folder, catalog, memo));
        }

        match &config.source.remote {
            Some(remote) => {
                info!(bucket = %remote.bucket, prefix = ?remote.prefix, "Using remote report cache");
                let store = build_object_store(remote)?;
                let cache = RemoteRefreshCache::new(store, Arc::clone(&catalog), &config.cache)
                    .with_prefix(remote.prefix.as_deref());
                Ok(Self::remote(Arc::new(cache), catalog, memo))
            }
            None => Err(RiskError::internal(
                "no report source configured: set source.local_path or source.remote",
            )),
        }
    }

    pub fn mode(&self) -> SourceKind {
        match self.source {
            Source::Local(_) => SourceKind::Local,
            Source::Remote(_) => SourceKind::Remote,
        }
    }

    pub fn catalog(&self) -> &Arc<ReportCatalog> {
        &self.catalog
    }

    /// Remote refresh cache, when running in remote mode.
    pub fn remote_cache(&self) -> Option<&Arc<RemoteRefreshCache>> {
        match &self.source {
            Source::Remote(cache) => Some(cache),
            Source::Local(_) => None,
        }
    }

    /// Current authoritative file of a report type.
    pub async fn resolve(&self, report_type: &ReportType) -> RiskResult<Arc<ReportFile>> {
        self.memo
            .get_or_resolve(report_type, self.resolve_uncached(report_type))
            .await
    }

    /// What a query over `report_type` reads: its current file, or the
    /// current file of every member when it names a family.
    ///
    /// A family fails with `NotFound` naming the first member without a file.
    pub async fn snapshot(&self, report_type: &ReportType) -> RiskResult<Arc<ReportSnapshot>> {
        let Some(family) = self.catalog.family(report_type) else {
            let file = self.resolve(report_type).await?;
            return Ok(Arc::new(ReportSnapshot::single(file, self.catalog.label(report_type))));
        };

        let mut members = Vec::with_capacity(family.len());
        for member in family {
            members.push(SnapshotMember {
                file: self.resolve(member).await?,
                label: self.catalog.label(member),
            });
        }
        let content_hash = combined_hash(members.iter().map(|m| m.file.content_hash.as_str()));

        debug!(
            report_type = %report_type,
            members = members.len(),
            content_hash = %content_hash,
            "Resolved report family"
        );
        Ok(Arc::new(ReportSnapshot {
            report_type: report_type.clone(),
            content_hash,
            members,
        }))
    }

    /// Drops the memoized resolution of one report type, or of every member
    /// of a family.
    pub async fn invalidate(&self, report_type: &ReportType) {
        match self.catalog.family(report_type) {
            Some(members) => {
                for member in members {
                    self.memo.invalidate(member).await;
                }
            }
            None => self.memo.invalidate(report_type).await,
        }
    }

    pub fn invalidate_all(&self) {
        self.memo.invalidate_all();
    }

    async fn resolve_uncached(&self, report_type: &ReportType) -> RiskResult<ReportFile> {
        let naming = self.catalog.naming(report_type)?;

        let file = match &self.source {
            Source::Local(folder) => {
                let folder = folder.clone();
                let (location, stamped_at) =
                    tokio::task::spawn_blocking(move || newest_local_file(&folder, &naming))
                        .await
                        .map_err(|e| RiskError::internal(format!("folder scan failed: {e}")))??
                        .ok_or_else(|| RiskError::not_found(report_type.as_str()))?;
                observe_file_async(report_type.clone(), location, stamped_at).await?
            }
            Source::Remote(cache) => {
                let entry = cache.current(report_type)?;
                let stamped_at = entry
                    .local_copy
                    .file_name()
                    .and_then(|name| naming.match_file_name(&name.to_string_lossy()))
                    .and_then(|m| m.stamped_at);
                let mut file =
                    observe_file_async(report_type.clone(), entry.local_copy, stamped_at).await?;
                file.last_modified = entry.remote_last_modified;
                file
            }
        };

        info!(
            report_type = %report_type,
            location = %file.location.display(),
            content_hash = %file.content_hash,
            size_bytes = file.size_bytes,
            "Resolved latest report file"
        );
        Ok(file)
    }
}

/// Newest file in `folder` following the naming rule.
///
/// Ordered by modification time, then stamped time, then file name. A missing
/// folder holds no files.
fn newest_local_file(
    folder: &Path,
    naming: &ReportNaming,
) -> RiskResult<Option<(PathBuf, Option<NaiveDateTime>)>> {
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(folder = %folder.display(), "Report folder does not exist");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<(SystemTime, Option<NaiveDateTime>, String, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(matched) = naming.match_file_name(&file_name) else {
            continue;
        };

        let path = entry.path();
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let modified = metadata.modified()?;

        let candidate = (modified, matched.stamped_at, file_name, path);
        let replace = match &newest {
            Some(best) => (candidate.0, candidate.1, &candidate.2) > (best.0, best.1, &best.2),
            None => true,
        };
        if replace {
            newest = Some(candidate);
        }
    }

    Ok(newest.map(|(_, stamped_at, _, path)| (path, stamped_at)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(path: &Path, contents: &str, modified: SystemTime) {
        std::fs::write(path, contents).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn test_newest_by_mtime_then_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let naming = ReportCatalog::builtin()
            .naming(&ReportType::from("actions"))
            .unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        touch(&dir.path().join("RS_Action_Lvl_20240101_000000.txt"), "a", base);
        touch(
            &dir.path().join("RS_Action_Lvl_20230101_000000.txt"),
            "b",
            base + Duration::from_secs(60),
        );
        touch(&dir.path().join("RS_CritAction_Lvl.txt"), "c", base + Duration::from_secs(600));

        let (path, _) = newest_local_file(dir.path(), &naming).unwrap().unwrap();
        assert!(path.ends_with("RS_Action_Lvl_20230101_000000.txt"));

        // Equal mtimes fall back to the stamped generation time.
        touch(
            &dir.path().join("RS_Action_Lvl_20250101_000000.txt"),
            "d",
            base + Duration::from_secs(60),
        );
        let (path, stamped) = newest_local_file(dir.path(), &naming).unwrap().unwrap();
        assert!(path.ends_with("RS_Action_Lvl_20250101_000000.txt"));
        assert!(stamped.is_some());
    }

    #[test]
    fn test_missing_folder_has_no_files() {
        let naming = ReportCatalog::builtin()
            .naming(&ReportType::from("perms"))
            .unwrap();
        let missing = newest_local_file(Path::new("/nonexistent/riskq/reports"), &naming).unwrap();
        assert!(missing.is_none());
    }
}
