//! Cursor Codec
//!
//! Pagination tokens are versioned JSON, base64 encoded (URL-safe, no
//! padding). A token binds the report identity, the query shape and the
//! resume position; it is only accepted while all three still match.
//!
//! Positions always count raw data rows of the snapshot, so a resumed scan
//! skips straight to them without evaluating filters. Ordered row fetches
//! additionally carry keyset state: the sort mark of the last emitted row,
//! and the best candidates found so far when a pass was cut short.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use riskq_core::schema::{canonicalize_column, canonicalize_columns};
use riskq_core::{QuerySpec, ReportSnapshot, ReportType, RiskError, RiskResult, SortDirection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current token format version.
pub const CURSOR_VERSION: u8 = 2;

const FIELD_SEPARATOR: u8 = 0x1f;

/// Which terminal operation a cursor resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorMode {
    Rows,
    Summary,
}

/// Position of one row in a requested ordering: its raw sort cells and its
/// raw row index, which breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortMark {
    #[serde(rename = "k")]
    pub keys: Vec<Option<String>>,
    #[serde(rename = "s")]
    pub seq: u64,
}

/// Resume state of a row fetch.
///
/// An unordered fetch only uses `position`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyset {
    /// Last row already emitted; the next page starts strictly after it.
    pub after: Option<SortMark>,
    /// Best rows found before `position` in an unfinished pass.
    pub candidates: Vec<SortMark>,
    /// Raw row the scan resumes at.
    pub position: u64,
}

impl Keyset {
    /// Fresh scan starting at raw row `position`.
    pub fn at(position: u64) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

/// Decoded pagination token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "rt")]
    pub report_type: ReportType,
    #[serde(rename = "h")]
    pub content_hash: String,
    #[serde(rename = "f")]
    pub filter_fingerprint: String,
    #[serde(rename = "o")]
    pub ordering_fingerprint: String,
    /// Raw row position the next scan resumes at.
    #[serde(rename = "n")]
    pub offset: u64,
    #[serde(rename = "m")]
    pub mode: CursorMode,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub after: Option<SortMark>,
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<SortMark>,
}

impl Cursor {
    /// Cursor resuming `spec` over `snapshot` at raw row `offset`.
    pub fn new(snapshot: &ReportSnapshot, spec: &QuerySpec, offset: u64, mode: CursorMode) -> RiskResult<Self> {
        Ok(Self {
            version: CURSOR_VERSION,
            report_type: snapshot.report_type.clone(),
            content_hash: snapshot.content_hash.clone(),
            filter_fingerprint: filter_fingerprint(spec)?,
            ordering_fingerprint: ordering_fingerprint(spec)?,
            offset,
            mode,
            after: None,
            candidates: Vec::new(),
        })
    }

    /// Cursor resuming a row fetch, keyset state included.
    pub fn resume(snapshot: &ReportSnapshot, spec: &QuerySpec, keyset: Keyset) -> RiskResult<Self> {
        let mut cursor = Self::new(snapshot, spec, keyset.position, CursorMode::Rows)?;
        cursor.after = keyset.after;
        cursor.candidates = keyset.candidates;
        Ok(cursor)
    }

    pub fn keyset(&self) -> Keyset {
        Keyset {
            after: self.after.clone(),
            candidates: self.candidates.clone(),
            position: self.offset,
        }
    }

    /// Opaque token form.
    pub fn encode(&self) -> RiskResult<String> {
        let payload = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(payload))
    }

    /// Parses a token. Fails with `MalformedCursor` on anything unreadable.
    pub fn decode(token: &str) -> RiskResult<Self> {
        let payload = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| RiskError::MalformedCursor(format!("invalid encoding: {e}")))?;
        let cursor: Cursor = serde_json::from_slice(&payload)
            .map_err(|e| RiskError::MalformedCursor(format!("invalid payload: {e}")))?;

        if cursor.version != CURSOR_VERSION {
            return Err(RiskError::MalformedCursor(format!(
                "unsupported cursor version {}",
                cursor.version
            )));
        }
        Ok(cursor)
    }

    /// Checks the cursor against the live snapshot and the current request.
    ///
    /// Any mismatch is `StaleCursor`; the client restarts from the first page.
    /// Keyset state that cannot belong to the request is `MalformedCursor`.
    pub fn validate(&self, snapshot: &ReportSnapshot, spec: &QuerySpec, mode: CursorMode) -> RiskResult<()> {
        let stale = |reason: &str| Err(RiskError::StaleCursor(reason.to_string()));

        if self.report_type != spec.report_type || self.report_type != snapshot.report_type {
            return stale("cursor belongs to another report type");
        }
        if self.content_hash != snapshot.content_hash {
            return stale("report file changed since the cursor was issued");
        }
        if self.mode != mode {
            return stale("cursor belongs to another kind of request");
        }
        if self.filter_fingerprint != filter_fingerprint(spec)? {
            return stale("filters, columns or grouping changed");
        }
        if self.ordering_fingerprint != ordering_fingerprint(spec)? {
            return stale("ordering changed");
        }

        let keyed = mode == CursorMode::Rows && !spec.order_by.is_empty();
        let mut marks = self.after.iter().chain(&self.candidates);
        if !keyed && (self.after.is_some() || !self.candidates.is_empty()) {
            return Err(RiskError::MalformedCursor("unexpected sort marks".into()));
        }
        if marks.any(|mark| mark.keys.len() != spec.order_by.len()) {
            return Err(RiskError::MalformedCursor("sort marks do not match the ordering".into()));
        }
        Ok(())
    }
}

/// Order-independent digest of filters, projection and grouping.
///
/// Column names are canonicalized and values lower-cased, matching how
/// filters are evaluated. The page size is not part of it.
pub fn filter_fingerprint(spec: &QuerySpec) -> RiskResult<String> {
    let mut predicates = spec
        .filters
        .iter()
        .map(|predicate| {
            let mut fields = predicate
                .fields
                .iter()
                .map(|f| canonicalize_column(f))
                .collect::<RiskResult<Vec<_>>>()?;
            fields.sort_unstable();
            fields.dedup();

            let mut values: Vec<String> = predicate
                .value
                .values()
                .into_iter()
                .map(|v| v.trim().to_lowercase())
                .collect();
            values.sort_unstable();

            Ok(format!(
                "{}\u{1e}{}\u{1e}{}",
                fields.join("\u{1d}"),
                predicate.op.as_str(),
                values.join("\u{1d}")
            ))
        })
        .collect::<RiskResult<Vec<_>>>()?;
    predicates.sort_unstable();

    let mut projection = canonicalize_columns(&spec.columns)?;
    projection.sort_unstable();
    projection.dedup();

    let group_by = spec
        .group_by
        .as_deref()
        .map(canonicalize_column)
        .transpose()?
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    for predicate in &predicates {
        hasher.update(predicate.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    hasher.update(b"|columns|");
    for column in &projection {
        hasher.update(column.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    hasher.update(b"|group|");
    hasher.update(group_by.as_bytes());

    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest of the ordering keys, in priority order.
pub fn ordering_fingerprint(spec: &QuerySpec) -> RiskResult<String> {
    let mut hasher = Sha256::new();
    for key in &spec.order_by {
        hasher.update(canonicalize_column(&key.column)?.as_bytes());
        let direction = match key.direction {
            SortDirection::Asc => ":asc",
            SortDirection::Desc => ":desc",
        };
        hasher.update(direction.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
