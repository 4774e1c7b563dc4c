use std::collections::HashMap;

use riskq_core::{SummaryGroup, SummaryResult};

use crate::scan::MAX_GROUP_EXAMPLES;

/// Combines the partial aggregates of a resumed summary.
///
/// Partial summaries cover disjoint row ranges, so counts add up and a group
/// keeps the earliest raw row it was seen at. The final top-N cut is applied
/// by [`SummaryMerger::finish`] once every range has been merged, with ties
/// broken by that first row, exactly like a single full pass.
#[derive(Debug, Clone)]
pub struct SummaryMerger {
    top: usize,
    groups: Vec<SummaryGroup>,
    slots: HashMap<String, usize>,
    rows_scanned: u64,
    rows_matched: u64,
}

impl SummaryMerger {
    pub fn new(top: usize) -> Self {
        Self {
            top,
            groups: Vec::new(),
            slots: HashMap::new(),
            rows_scanned: 0,
            rows_matched: 0,
        }
    }

    /// Adds one (partial or complete) summary page.
    pub fn merge(&mut self, page: &SummaryResult) -> &mut Self {
        self.rows_scanned += page.rows_scanned;
        self.rows_matched += page.rows_matched;

        for group in &page.groups {
            let key = group.group.to_string();
            match self.slots.get(&key) {
                Some(&slot) => {
                    let merged = &mut self.groups[slot];
                    merged.count += group.count;
                    merged.first_seen = merged.first_seen.min(group.first_seen);
                    let room = MAX_GROUP_EXAMPLES.saturating_sub(merged.examples.len());
                    merged.examples.extend(group.examples.iter().take(room).cloned());
                }
                None => {
                    self.slots.insert(key, self.groups.len());
                    self.groups.push(group.clone());
                }
            }
        }
        self
    }

    pub fn rows_scanned(&self) -> u64 {
        self.rows_scanned
    }

    pub fn rows_matched(&self) -> u64 {
        self.rows_matched
    }

    /// Merged groups by count descending then first occurrence, cut to the top N.
    pub fn finish(self) -> Vec<SummaryGroup> {
        let mut groups = self.groups;
        groups.sort_by(SummaryGroup::rank);
        groups.truncate(self.top);
        groups
    }
}
