//! Greedy monotonic alignment of expected against observed trigger codes.
//!
//! The observed pointer only moves on a match, so an observed code can never
//! be paired with an expected entry that precedes an earlier unmatched one.
//! Leftover observed codes at the end are spurious; everything else that
//! fails to match is a drop.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodeSample {
    pub code: u8,
    /// Seconds on whatever clock produced the sample, if known.
    #[serde(default)]
    pub time: Option<f64>,
}

impl CodeSample {
    pub fn untimed(code: u8) -> Self {
        Self { code, time: None }
    }

    pub fn at(code: u8, time: f64) -> Self {
        Self {
            code,
            time: Some(time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Matched,
    Dropped,
    Spurious,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentEntry {
    pub expected_position: Option<usize>,
    pub observed_position: Option<usize>,
    pub expected_code: Option<u8>,
    pub observed_code: Option<u8>,
    pub classification: Classification,
    /// `observed.time - expected.time` for matches where both are timed.
    pub time_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl TimingStats {
    fn from_deltas(deltas: &[f64]) -> Option<Self> {
        if deltas.is_empty() {
            return None;
        }
        let n = deltas.len() as f64;
        let mean = deltas.iter().sum::<f64>() / n;
        let variance = deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: deltas.len(),
            mean,
            std_dev: variance.sqrt(),
            min: deltas.iter().copied().fold(f64::INFINITY, f64::min),
            max: deltas.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSummary {
    pub total_expected: usize,
    pub total_observed: usize,
    pub matched: usize,
    pub dropped: usize,
    pub spurious: usize,
    pub drop_rate: f64,
    pub per_code_drops: BTreeMap<u8, usize>,
    pub timing: Option<TimingStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationAlignment {
    pub entries: Vec<AlignmentEntry>,
    pub summary: AlignmentSummary,
}

pub fn align(expected: &[CodeSample], observed: &[CodeSample]) -> ValidationAlignment {
    let mut entries = Vec::with_capacity(expected.len().max(observed.len()));
    let mut per_code_drops = BTreeMap::new();
    let mut deltas = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < expected.len() && j < observed.len() {
        let (e, o) = (expected[i], observed[j]);
        if e.code == o.code {
            let time_delta = match (e.time, o.time) {
                (Some(te), Some(to)) => Some(to - te),
                _ => None,
            };
            deltas.extend(time_delta);
            entries.push(AlignmentEntry {
                expected_position: Some(i),
                observed_position: Some(j),
                expected_code: Some(e.code),
                observed_code: Some(o.code),
                classification: Classification::Matched,
                time_delta,
            });
            i += 1;
            j += 1;
        } else {
            *per_code_drops.entry(e.code).or_insert(0) += 1;
            entries.push(dropped(i, e.code));
            i += 1;
        }
    }
    for (pos, e) in expected.iter().enumerate().skip(i) {
        *per_code_drops.entry(e.code).or_insert(0) += 1;
        entries.push(dropped(pos, e.code));
    }
    for (pos, o) in observed.iter().enumerate().skip(j) {
        entries.push(AlignmentEntry {
            expected_position: None,
            observed_position: Some(pos),
            expected_code: None,
            observed_code: Some(o.code),
            classification: Classification::Spurious,
            time_delta: None,
        });
    }

    let count = |c: Classification| entries.iter().filter(|e| e.classification == c).count();
    let (matched, dropped_n, spurious) = (
        count(Classification::Matched),
        count(Classification::Dropped),
        count(Classification::Spurious),
    );
    let summary = AlignmentSummary {
        total_expected: expected.len(),
        total_observed: observed.len(),
        matched,
        dropped: dropped_n,
        spurious,
        drop_rate: if expected.is_empty() {
            0.0
        } else {
            dropped_n as f64 / expected.len() as f64
        },
        per_code_drops,
        timing: TimingStats::from_deltas(&deltas),
    };
    ValidationAlignment { entries, summary }
}

fn dropped(position: usize, code: u8) -> AlignmentEntry {
    AlignmentEntry {
        expected_position: Some(position),
        observed_position: None,
        expected_code: Some(code),
        observed_code: None,
        classification: Classification::Dropped,
        time_delta: None,
    }
}
