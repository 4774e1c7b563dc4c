//! Report naming catalog.
//!
//! Maps each report type to the file-name prefix its exports use and the
//! label written into the `ReportType` column. Exports are named
//! `{prefix}_{YYYYMMDD}_{HHMMSS}.txt` or plainly `{prefix}.txt` (`.tsv` is
//! accepted as well).

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use regex::Regex;
use riskq_core::{ReportType, ReportTypeConfig, RiskError, RiskResult};

const BUILTIN_TYPES: [(&str, &str, &str); 4] = [
    (ReportType::ACTIONS, "RS_Action_Lvl", "Action"),
    (ReportType::CRIT_ACTIONS, "RS_CritAction_Lvl", "Critical Action"),
    (ReportType::PERMS, "RS_Perm_Lvl", "Permission"),
    (ReportType::CRIT_PERMS, "RS_CritPerm_Lvl", "Critical Permission"),
];

const BUILTIN_FAMILIES: [(&str, [&str; 2]); 2] = [
    (ReportType::ALL_ACTIONS, [ReportType::ACTIONS, ReportType::CRIT_ACTIONS]),
    (ReportType::ALL_PERMS, [ReportType::PERMS, ReportType::CRIT_PERMS]),
];

/// File naming rule of one report type.
#[derive(Debug, Clone)]
pub struct ReportNaming {
    report_type: ReportType,
    prefix: String,
    label: String,
    pattern: Regex,
}

/// A file name accepted by a [`ReportNaming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameMatch {
    /// Generation time carried by the name, if any.
    pub stamped_at: Option<NaiveDateTime>,
}

impl ReportNaming {
    pub fn new(
        report_type: ReportType,
        prefix: impl Into<String>,
        label: impl Into<String>,
    ) -> RiskResult<Self> {
        let prefix = prefix.into();
        let pattern = Regex::new(&format!(
            r"^{}(?:_(\d{{8}})_(\d{{6}}))?\.(?:txt|tsv)$",
            regex::escape(&prefix)
        ))
        .map_err(|e| RiskError::internal(format!("invalid naming pattern for {prefix}: {e}")))?;

        Ok(Self {
            report_type,
            prefix,
            label: label.into(),
            pattern,
        })
    }

    pub fn report_type(&self) -> &ReportType {
        &self.report_type
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Matches a bare file name (no directory part) against the naming rule.
    ///
    /// A stamp that is not a valid calendar date still matches; it just
    /// carries no generation time.
    pub fn match_file_name(&self, file_name: &str) -> Option<NameMatch> {
        let captures = self.pattern.captures(file_name)?;
        let stamped_at = match (captures.get(1), captures.get(2)) {
            (Some(date), Some(time)) => NaiveDateTime::parse_from_str(
                &format!("{}{}", date.as_str(), time.as_str()),
                "%Y%m%d%H%M%S",
            )
            .ok(),
            _ => None,
        };
        Some(NameMatch { stamped_at })
    }
}

/// Known report types, their naming rules and the report families over them.
///
/// A family is read as the concatenation of its members' current files.
#[derive(Debug, Clone)]
pub struct ReportCatalog {
    entries: BTreeMap<ReportType, ReportNaming>,
    families: BTreeMap<ReportType, Vec<ReportType>>,
}

impl ReportCatalog {
    /// Catalog holding the four standard risk exports and their two families.
    pub fn builtin() -> Self {
        let entries = BUILTIN_TYPES
            .iter()
            .filter_map(|(name, prefix, label)| {
                ReportNaming::new(ReportType::from(*name), *prefix, *label)
                    .ok()
                    .map(|naming| (ReportType::from(*name), naming))
            })
            .collect();
        let families = BUILTIN_FAMILIES
            .iter()
            .map(|(name, members)| {
                (
                    ReportType::from(*name),
                    members.iter().map(|m| ReportType::from(*m)).collect(),
                )
            })
            .collect();
        Self { entries, families }
    }

    /// Builtin catalog extended (or overridden) by configured report types.
    pub fn with_overrides(overrides: &BTreeMap<String, ReportTypeConfig>) -> RiskResult<Self> {
        let mut catalog = Self::builtin();
        for (name, config) in overrides {
            let report_type = ReportType::from(name.as_str());
            let label = config.label.clone().unwrap_or_else(|| name.clone());
            let naming = ReportNaming::new(report_type.clone(), config.prefix.trim(), label)?;
            catalog.entries.insert(report_type, naming);
        }
        Ok(catalog)
    }

    /// Adds (or replaces) families. Members must be plain report types.
    pub fn with_families(mut self, families: &BTreeMap<String, Vec<String>>) -> RiskResult<Self> {
        for (name, members) in families {
            let members: Vec<ReportType> = members.iter().map(|m| ReportType::from(m.trim())).collect();
            self.families.insert(ReportType::from(name.as_str()), members);
        }

        for (family, members) in &self.families {
            if members.is_empty() {
                return Err(RiskError::internal(format!("family {family} has no members")));
            }
            if let Some(nested) = members.iter().find(|m| self.families.contains_key(*m)) {
                return Err(RiskError::internal(format!(
                    "family {family} lists family {nested}; families cannot nest"
                )));
            }
        }
        Ok(self)
    }

    /// Member types of a family, or `None` for a plain report type.
    pub fn family(&self, report_type: &ReportType) -> Option<&[ReportType]> {
        self.families.get(report_type).map(Vec::as_slice)
    }

    /// Naming rule for a report type.
    ///
    /// Types absent from the catalog use their own name as prefix and label.
    pub fn naming(&self, report_type: &ReportType) -> RiskResult<ReportNaming> {
        match self.entries.get(report_type) {
            Some(naming) => Ok(naming.clone()),
            None => ReportNaming::new(
                report_type.clone(),
                report_type.as_str(),
                report_type.as_str(),
            ),
        }
    }

    /// Label written into the `ReportType` column.
    pub fn label(&self, report_type: &ReportType) -> String {
        self.entries
            .get(report_type)
            .map(|n| n.label.clone())
            .unwrap_or_else(|| report_type.to_string())
    }

    /// Plain report types the catalog knows about, in name order.
    pub fn report_types(&self) -> impl Iterator<Item = &ReportType> {
        self.entries.keys()
    }

    /// Family names, in name order.
    pub fn families(&self) -> impl Iterator<Item = &ReportType> {
        self.families.keys()
    }
}

impl Default for ReportCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
