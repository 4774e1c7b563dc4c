//! Streaming reader producing normalized report rows.

use std::fs::File;

use csv::ByteRecord;
use riskq_core::schema::{column_kind, ColumnKind, CANONICAL_COLUMNS, IS_CRITICAL_COLUMN, REPORT_TYPE_COLUMN};
use riskq_core::{Record, ReportSnapshot, RiskResult, SnapshotMember};
use serde_json::Value;

/// One report row mapped onto the canonical columns. Empty cells are null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    pub fn from_values(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    /// Cell at a canonical column position.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// Field-keyed record of the projected columns, in projection order.
    pub fn project(&self, projection: &[(usize, &'static str)]) -> Record {
        let mut record = Record::with_capacity(projection.len());
        for &(index, name) in projection {
            let value = match (column_kind(name), self.get(index)) {
                (_, None) => Value::Null,
                (ColumnKind::Boolean, Some(cell)) => Value::Bool(cell.eq_ignore_ascii_case("true")),
                (ColumnKind::Utf8, Some(cell)) => Value::String(cell.to_string()),
            };
            record.insert(name.to_string(), value);
        }
        record
    }
}

/// One member file of a snapshot, open for sequential reads.
struct MemberReader {
    reader: csv::Reader<File>,
    mapping: Vec<Option<usize>>,
    label: String,
    critical: bool,
}

impl MemberReader {
    fn open(member: &SnapshotMember) -> RiskResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .quoting(false)
            .from_path(&member.file.location)?;

        let header: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|h| {
                String::from_utf8_lossy(h)
                    .trim_start_matches('\u{feff}')
                    .trim()
                    .to_string()
            })
            .collect();

        let mapping = CANONICAL_COLUMNS
            .iter()
            .map(|name| {
                if *name == REPORT_TYPE_COLUMN || *name == IS_CRITICAL_COLUMN {
                    None
                } else {
                    header.iter().position(|h| h == name)
                }
            })
            .collect();

        Ok(Self {
            reader,
            mapping,
            label: member.label.clone(),
            critical: member.file.is_critical(),
        })
    }

    fn decode(&self, record: &ByteRecord) -> Row {
        let values = CANONICAL_COLUMNS
            .iter()
            .zip(&self.mapping)
            .map(|(name, physical)| match *name {
                REPORT_TYPE_COLUMN => Some(self.label.clone()),
                IS_CRITICAL_COLUMN => Some(self.critical.to_string()),
                _ => physical
                    .and_then(|idx| record.get(idx))
                    .map(|cell| String::from_utf8_lossy(cell).trim().to_string())
                    .filter(|cell| !cell.is_empty()),
            })
            .collect();
        Row::from_values(values)
    }
}

/// Sequential reader over the data rows of a report snapshot.
///
/// Member files are read one after another, so a family reads as the
/// concatenation of its members. Physical columns are matched to canonical
/// ones by header name per file; canonical columns a file lacks read as null.
/// `ReportType` and `IsCritical` are derived from the member identity, never
/// read from the file.
///
/// Positions count data rows across all members.
pub struct RowReader {
    members: Vec<SnapshotMember>,
    next_member: usize,
    current: Option<MemberReader>,
    record: ByteRecord,
    buffered: bool,
    position: u64,
}

impl RowReader {
    pub fn open(snapshot: &ReportSnapshot) -> RiskResult<Self> {
        let mut reader = Self {
            members: snapshot.members.clone(),
            next_member: 0,
            current: None,
            record: ByteRecord::new(),
            buffered: false,
            position: 0,
        };
        reader.open_next()?;
        Ok(reader)
    }

    /// Number of data rows consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True once every member is exhausted.
    pub fn at_end(&mut self) -> RiskResult<bool> {
        Ok(!self.fill()?)
    }

    /// Reads the next row, or `None` after the last member.
    pub fn next_row(&mut self) -> RiskResult<Option<Row>> {
        if !self.fill()? {
            return Ok(None);
        }
        self.buffered = false;
        self.position += 1;
        Ok(self.current.as_ref().map(|member| member.decode(&self.record)))
    }

    /// Skips up to `count` data rows without decoding them. Returns rows skipped.
    pub fn skip_rows(&mut self, count: u64) -> RiskResult<u64> {
        let mut skipped = 0;
        while skipped < count && self.fill()? {
            self.buffered = false;
            skipped += 1;
        }
        self.position += skipped;
        Ok(skipped)
    }

    /// Buffers the next raw record, moving on to later members as each ends.
    fn fill(&mut self) -> RiskResult<bool> {
        if self.buffered {
            return Ok(true);
        }
        while let Some(member) = self.current.as_mut() {
            if member.reader.read_byte_record(&mut self.record)? {
                self.buffered = true;
                return Ok(true);
            }
            self.open_next()?;
        }
        Ok(false)
    }

    fn open_next(&mut self) -> RiskResult<()> {
        self.current = match self.members.get(self.next_member) {
            Some(member) => Some(MemberReader::open(member)?),
            None => None,
        };
        self.next_member += 1;
        Ok(())
    }
}
