//! Content identity of report files.
//!
//! A report file is identified by the SHA-256 of its bytes, so touching a file
//! without changing its contents keeps outstanding cursors valid.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use riskq_core::{ReportFile, ReportType, RiskError, RiskResult, RowSchema};
use sha2::{Digest, Sha256};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Streams a file through SHA-256 and returns the lowercase hex digest.
pub fn content_hash(path: &Path) -> RiskResult<String> {
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Identity of files read together: SHA-256 over the member hashes in order.
pub fn combined_hash<'a>(hashes: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for (i, hash) in hashes.into_iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(hash.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Reads the tab-separated header row. An empty file has no columns.
pub fn read_header(path: &Path) -> RiskResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .from_path(path)?;

    let header = reader
        .byte_headers()?
        .iter()
        .map(|field| {
            String::from_utf8_lossy(field)
                .trim_start_matches('\u{feff}')
                .trim()
                .to_string()
        })
        .collect();
    Ok(header)
}

/// Builds the immutable description of a report file. Blocking.
pub fn observe_file(
    report_type: ReportType,
    location: PathBuf,
    stamped_at: Option<NaiveDateTime>,
) -> RiskResult<ReportFile> {
    let metadata = std::fs::metadata(&location)?;
    let last_modified: DateTime<Utc> = metadata.modified()?.into();
    let content_hash = content_hash(&location)?;
    let header = read_header(&location)?;

    Ok(ReportFile {
        report_type,
        content_hash,
        last_modified,
        stamped_at,
        size_bytes: metadata.len(),
        row_schema: RowSchema::from_header(&header),
        location,
    })
}

/// [`observe_file`] on the blocking thread pool.
pub async fn observe_file_async(
    report_type: ReportType,
    location: PathBuf,
    stamped_at: Option<NaiveDateTime>,
) -> RiskResult<ReportFile> {
    tokio::task::spawn_blocking(move || observe_file(report_type, location, stamped_at))
        .await
        .map_err(|e| RiskError::internal(format!("hashing task failed: {e}")))?
}
