//! Integration tests for the remote refresh cache
//!
//! Tests cover:
//! 1. UpstreamUnavailable before the first successful fetch
//! 2. Newest-object selection and unchanged detection
//! 3. Stale-but-available entries after a failed refresh
//! 4. Remote-mode resolution through the locator
//! 5. Concurrent resolutions during a refresh
//! 6. Background workers

use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use riskq_core::{CacheConfig, ReportType, RiskError};
use riskq_storage::{
    LatestFileMemo, RefreshOutcome, RemoteRefreshCache, ReportCatalog, ReportLocator, SourceKind,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const HEADER: &str = "User ID\tUser Name\tRisk Level\n";

async fn put_report(store: &Arc<dyn ObjectStore>, key: &str, body: &str) {
    store
        .put(&ObjectPath::from(key), PutPayload::from(format!("{HEADER}{body}").into_bytes()))
        .await
        .expect("Failed to put object");
    // InMemory stamps last_modified with the wall clock
    tokio::time::sleep(Duration::from_millis(5)).await;
}

fn remote_cache(store: Arc<dyn ObjectStore>, dir: &Path) -> Arc<RemoteRefreshCache> {
    let config = CacheConfig {
        dir: dir.to_path_buf(),
        ..CacheConfig::default()
    };
    Arc::new(
        RemoteRefreshCache::new(store, Arc::new(ReportCatalog::builtin()), &config)
            .with_prefix(Some("exports")),
    )
}

#[tokio::test]
async fn test_unavailable_before_first_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let cache = remote_cache(store, dir.path());
    let actions = ReportType::from("actions");

    assert!(matches!(
        cache.current(&actions),
        Err(RiskError::UpstreamUnavailable { .. })
    ));

    // Nothing matches under the prefix: the refresh fails and so does current()
    assert!(cache.refresh(&actions).await.is_err());
    let err = cache.current(&actions).unwrap_err();
    assert!(err.to_string().contains("RS_Action_Lvl"));
}

#[tokio::test]
async fn test_refresh_picks_newest_and_detects_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    put_report(&store, "exports/RS_Action_Lvl_20240101_000000.txt", "U1\tAlice\tHigh\n").await;
    put_report(&store, "exports/RS_Action_Lvl_20240102_000000.txt", "U2\tBob\tLow\n").await;
    put_report(&store, "other/RS_Action_Lvl_20240103_000000.txt", "U3\tCarol\tLow\n").await;

    let cache = remote_cache(Arc::clone(&store), dir.path());
    let actions = ReportType::from("actions");

    let entry = match cache.refresh(&actions).await.unwrap() {
        RefreshOutcome::Downloaded(entry) => entry,
        other => panic!("expected download, got {other:?}"),
    };
    assert_eq!(entry.remote_key, "exports/RS_Action_Lvl_20240102_000000.txt");
    assert!(entry.local_copy.starts_with(dir.path()));
    assert_eq!(
        std::fs::read_to_string(&entry.local_copy).unwrap(),
        format!("{HEADER}U2\tBob\tLow\n")
    );
    assert_eq!(cache.current(&actions).unwrap(), entry);

    assert_eq!(
        cache.refresh(&actions).await.unwrap(),
        RefreshOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    put_report(&store, "exports/RS_Perm_Lvl.txt", "U1\tAlice\tHigh\n").await;

    let cache = remote_cache(Arc::clone(&store), dir.path());
    let perms = ReportType::from("perms");
    cache.refresh(&perms).await.unwrap();
    let before = cache.current(&perms).unwrap();

    store.delete(&ObjectPath::from("exports/RS_Perm_Lvl.txt")).await.unwrap();
    assert!(cache.refresh(&perms).await.is_err());

    assert_eq!(cache.current(&perms).unwrap(), before);
    assert!(before.local_copy.exists());
}

#[tokio::test]
async fn test_locator_resolves_remote_copy() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    put_report(&store, "exports/RS_CritAction_Lvl_20240101_000000.txt", "U1\tAlice\tHigh\n").await;

    let cache = remote_cache(Arc::clone(&store), dir.path());
    let locator = ReportLocator::remote(
        Arc::clone(&cache),
        Arc::new(ReportCatalog::builtin()),
        LatestFileMemo::new(Duration::from_secs(60)),
    );
    assert_eq!(locator.mode(), SourceKind::Remote);

    let crit = ReportType::from("crit_actions");
    assert!(matches!(
        locator.resolve(&crit).await,
        Err(RiskError::UpstreamUnavailable { .. })
    ));

    cache.refresh(&crit).await.unwrap();
    let first = locator.resolve(&crit).await.unwrap();
    assert!(first.is_critical());
    assert!(first.stamped_at.is_some());
    assert_eq!(first.last_modified, cache.current(&crit).unwrap().remote_last_modified);

    put_report(&store, "exports/RS_CritAction_Lvl_20240102_000000.txt", "U2\tBob\tLow\n").await;
    cache.refresh(&crit).await.unwrap();
    locator.invalidate(&crit).await;

    let second = locator.resolve(&crit).await.unwrap();
    assert_ne!(first.content_hash, second.content_hash);
    // The previous version stays on disk for readers still holding it
    assert!(first.location.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolutions_during_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let old_body: String = (0..2000).map(|i| format!("U{i}\tUser {i}\tHigh\n")).collect();
    let new_body: String = (0..2000).map(|i| format!("U{i}\tUser {i}\tLow\n")).collect();
    put_report(&store, "exports/RS_Action_Lvl_20240101_000000.txt", &old_body).await;

    let cache = remote_cache(Arc::clone(&store), dir.path());
    let actions = ReportType::from("actions");
    cache.refresh(&actions).await.unwrap();

    let locator = Arc::new(ReportLocator::remote(
        Arc::clone(&cache),
        Arc::new(ReportCatalog::builtin()),
        LatestFileMemo::new(Duration::from_millis(1)),
    ));
    let pre_hash = locator.resolve(&actions).await.unwrap().content_hash.clone();

    put_report(&store, "exports/RS_Action_Lvl_20240102_000000.txt", &new_body).await;

    let mut readers = Vec::new();
    for _ in 0..16 {
        let locator = Arc::clone(&locator);
        let actions = actions.clone();
        readers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..10 {
                locator.invalidate(&actions).await;
                seen.push(locator.resolve(&actions).await.unwrap().content_hash.clone());
            }
            seen
        }));
    }
    cache.refresh(&actions).await.unwrap();

    let mut observed = HashSet::new();
    for reader in readers {
        observed.extend(reader.await.unwrap());
    }

    locator.invalidate(&actions).await;
    let post_hash = locator.resolve(&actions).await.unwrap().content_hash.clone();
    assert_ne!(pre_hash, post_hash);
    assert!(observed.iter().all(|h| *h == pre_hash || *h == post_hash));
}

#[tokio::test]
async fn test_background_workers_fetch_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    put_report(&store, "exports/RS_Perm_Lvl_20240101_000000.txt", "U1\tAlice\tHigh\n").await;

    let cache = remote_cache(store, dir.path());
    cache.start_workers();

    let perms = ReportType::from("perms");
    let fetched = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cache.current(&perms).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(fetched.is_ok(), "worker never fetched the report");

    cache.shutdown();
}
