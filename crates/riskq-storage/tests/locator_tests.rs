//! Integration tests for local-folder report resolution
//!
//! Tests cover:
//! 1. Newest-file selection per report type
//! 2. Memoization until TTL expiry or invalidation
//! 3. Content-based identity across mtime changes
//! 4. NotFound for empty and missing folders
//! 5. Source selection from configuration
//! 6. Report family snapshots

use riskq_core::{RiskError, RiskqConfig, ReportType, SourceConfig};
use riskq_storage::{LatestFileMemo, ReportCatalog, ReportLocator, SourceKind};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const HEADER: &str = "User ID\tUser Name\tRisk Level\n";

/// Helper: Write a report file with an explicit modification time
fn write_report(dir: &Path, name: &str, body: &str, age_secs: u64) {
    let path = dir.join(name);
    std::fs::write(&path, format!("{HEADER}{body}")).expect("Failed to write report");
    File::options()
        .write(true)
        .open(&path)
        .and_then(|f| f.set_modified(SystemTime::now() - Duration::from_secs(age_secs)))
        .expect("Failed to set mtime");
}

fn local_locator(dir: &Path, ttl: Duration) -> ReportLocator {
    ReportLocator::local(
        dir,
        Arc::new(ReportCatalog::builtin()),
        LatestFileMemo::new(ttl),
    )
}

#[tokio::test]
async fn test_resolves_newest_file_per_type() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_Action_Lvl_20240101_000000.txt", "U1\tAlice\tHigh\n", 600);
    write_report(dir.path(), "RS_Action_Lvl_20240201_000000.txt", "U2\tBob\tLow\n", 60);
    write_report(dir.path(), "RS_Perm_Lvl_20240301_000000.txt", "U3\tCarol\tHigh\n", 10);

    let locator = local_locator(dir.path(), Duration::from_secs(60));
    assert_eq!(locator.mode(), SourceKind::Local);

    let actions = locator.resolve(&ReportType::from("actions")).await.unwrap();
    assert!(actions.location.ends_with("RS_Action_Lvl_20240201_000000.txt"));
    assert!(actions.location.is_absolute());
    assert!(actions.stamped_at.is_some());

    let perms = locator.resolve(&ReportType::from("perms")).await.unwrap();
    assert!(perms.location.ends_with("RS_Perm_Lvl_20240301_000000.txt"));
    assert_ne!(actions.content_hash, perms.content_hash);
}

#[tokio::test]
async fn test_memo_holds_until_invalidated() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_Action_Lvl_20240101_000000.txt", "U1\tAlice\tHigh\n", 600);

    let locator = local_locator(dir.path(), Duration::from_secs(60));
    let actions = ReportType::from("actions");
    let first = locator.resolve(&actions).await.unwrap();

    // A newer export lands; the memo keeps serving the old file
    write_report(dir.path(), "RS_Action_Lvl_20240102_000000.txt", "U9\tZed\tLow\n", 0);
    let memoized = locator.resolve(&actions).await.unwrap();
    assert!(Arc::ptr_eq(&first, &memoized));

    locator.invalidate(&actions).await;
    let fresh = locator.resolve(&actions).await.unwrap();
    assert!(fresh.location.ends_with("RS_Action_Lvl_20240102_000000.txt"));
    assert_ne!(fresh.content_hash, first.content_hash);
}

#[tokio::test]
async fn test_memo_expires_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_Perm_Lvl.txt", "U1\tAlice\tHigh\n", 600);

    let locator = local_locator(dir.path(), Duration::from_millis(50));
    let perms = ReportType::from("perms");
    let first = locator.resolve(&perms).await.unwrap();

    std::fs::write(dir.path().join("RS_Perm_Lvl.txt"), format!("{HEADER}U2\tBob\tLow\n")).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let second = locator.resolve(&perms).await.unwrap();
    assert_ne!(first.content_hash, second.content_hash);
}

#[tokio::test]
async fn test_touch_keeps_content_hash() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_CritPerm_Lvl.txt", "U1\tAlice\tHigh\n", 600);

    let locator = local_locator(dir.path(), Duration::from_secs(60));
    let crit = ReportType::from("crit_perms");
    let before = locator.resolve(&crit).await.unwrap();

    write_report(dir.path(), "RS_CritPerm_Lvl.txt", "U1\tAlice\tHigh\n", 0);
    locator.invalidate_all();

    let after = locator.resolve(&crit).await.unwrap();
    assert_eq!(before.content_hash, after.content_hash);
    assert!(after.last_modified > before.last_modified);
}

#[tokio::test]
async fn test_not_found_cases() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "unrelated.txt", "", 0);

    let locator = local_locator(dir.path(), Duration::from_secs(60));
    let err = locator
        .resolve(&ReportType::from("actions"))
        .await
        .unwrap_err();
    assert!(matches!(err, RiskError::NotFound { ref report_type } if report_type == "actions"));

    let missing = local_locator(&dir.path().join("missing"), Duration::from_secs(60));
    let err = missing
        .resolve(&ReportType::from("actions"))
        .await
        .unwrap_err();
    assert!(matches!(err, RiskError::NotFound { .. }));
}

#[tokio::test]
async fn test_unknown_type_uses_its_own_prefix() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_ActionAudit_20240101_120000.txt", "U1\tAlice\tHigh\n", 0);

    let locator = local_locator(dir.path(), Duration::from_secs(60));
    let file = locator
        .resolve(&ReportType::from("RS_ActionAudit"))
        .await
        .unwrap();
    assert!(file.location.ends_with("RS_ActionAudit_20240101_120000.txt"));
}

#[tokio::test]
async fn test_from_config_prefers_local_folder() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_Action_Lvl.txt", "U1\tAlice\tHigh\n", 0);

    let config = RiskqConfig {
        source: SourceConfig::with_local_path(format!("  \"{}\" ", dir.path().display())),
        ..RiskqConfig::default()
    };

    let locator = ReportLocator::from_config(&config).unwrap();
    assert_eq!(locator.mode(), SourceKind::Local);
    assert!(locator.remote_cache().is_none());
    assert!(locator.resolve(&ReportType::from("actions")).await.is_ok());

    let unconfigured = ReportLocator::from_config(&RiskqConfig::default());
    assert!(unconfigured.is_err());
}

#[tokio::test]
async fn test_family_snapshot_tracks_every_member() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_Action_Lvl_20240101_000000.txt", "U1\tAlice\tHigh\n", 60);
    write_report(dir.path(), "RS_CritAction_Lvl_20240101_000000.txt", "U2\tBob\tHigh\n", 60);

    let locator = local_locator(dir.path(), Duration::from_secs(60));
    let family = ReportType::from(ReportType::ALL_ACTIONS);
    let snapshot = locator.snapshot(&family).await.unwrap();

    assert_eq!(snapshot.report_type, family);
    let labels: Vec<_> = snapshot.members.iter().map(|m| m.label.as_str()).collect();
    assert_eq!(labels, vec!["Action", "Critical Action"]);
    assert!(!snapshot.members[0].file.is_critical());
    assert!(snapshot.members[1].file.is_critical());
    assert_eq!(snapshot.locations().len(), 2);

    let member_hashes = [
        snapshot.members[0].file.content_hash.as_str(),
        snapshot.members[1].file.content_hash.as_str(),
    ];
    assert_eq!(snapshot.content_hash, riskq_storage::combined_hash(member_hashes));

    // A plain type snapshots to its single file
    let actions = locator.snapshot(&ReportType::from("actions")).await.unwrap();
    assert_eq!(actions.members.len(), 1);
    assert_eq!(actions.content_hash, snapshot.members[0].file.content_hash);

    // Replacing one member changes the family identity
    write_report(dir.path(), "RS_CritAction_Lvl_20240102_000000.txt", "U3\tCarol\tLow\n", 0);
    locator.invalidate(&family).await;
    let changed = locator.snapshot(&family).await.unwrap();
    assert_eq!(changed.members[0].file.content_hash, snapshot.members[0].file.content_hash);
    assert_ne!(changed.content_hash, snapshot.content_hash);
}

#[tokio::test]
async fn test_family_with_missing_member_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    write_report(dir.path(), "RS_Perm_Lvl_20240101_000000.txt", "U1\tAlice\tHigh\n", 0);

    let locator = local_locator(dir.path(), Duration::from_secs(60));
    let err = locator
        .snapshot(&ReportType::from(ReportType::ALL_PERMS))
        .await
        .unwrap_err();
    assert!(matches!(err, RiskError::NotFound { ref report_type } if report_type == "crit_perms"));
}
