use serde::Serialize;
use std::collections::BTreeMap;
use trigsync_core::EventKind;
use trigsync_runner::ExpectedTrigger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroundTruthStats {
    pub total: usize,
    pub distinct_codes: usize,
    pub per_kind: BTreeMap<String, usize>,
    pub per_code: BTreeMap<u8, usize>,
    pub per_block: BTreeMap<usize, usize>,
    pub trials: usize,
}

/// Counts of an expanded trigger sequence, for eyeballing a protocol before
/// a session and for sanity-checking a recording afterwards.
pub fn ground_truth_stats(events: &[ExpectedTrigger]) -> GroundTruthStats {
    let mut per_kind = BTreeMap::new();
    let mut per_code = BTreeMap::new();
    let mut per_block = BTreeMap::new();
    let mut trials = 0;
    for event in events {
        *per_kind.entry(event.kind.name().to_string()).or_insert(0) += 1;
        *per_code.entry(event.code).or_insert(0) += 1;
        *per_block.entry(event.block_number).or_insert(0) += 1;
        if matches!(event.kind, EventKind::TrialStart(_)) {
            trials += 1;
        }
    }
    GroundTruthStats {
        total: events.len(),
        distinct_codes: per_code.len(),
        per_kind,
        per_code,
        per_block,
        trials,
    }
}
