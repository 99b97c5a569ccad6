//! Validation report: inputs, alignment, and the data-quality verdict.

use crate::align::{align, AlignmentEntry, AlignmentSummary, CodeSample};
use crate::decode::RecordedSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use trigsync_core::{atomic_write_json_pretty, canonical_json_digest};
use trigsync_runner::{ExpectedTrigger, TriggerEvent};

pub const REPORT_SCHEMA: &str = "validation_report_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedSource {
    /// Rows of the mirror log.
    MirrorLog,
    /// Sequence regenerated from the stored protocol.
    GroundTruth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub expected_source: ExpectedSource,
    pub expected_digest: String,
    pub observed_digest: String,
    pub drop_rate_threshold: f64,
    pub quality_warning: bool,
    pub summary: AlignmentSummary,
    pub entries: Vec<AlignmentEntry>,
}

impl ValidationReport {
    pub fn build(
        expected: &[CodeSample],
        observed: &[CodeSample],
        source: ExpectedSource,
        drop_rate_threshold: f64,
    ) -> io::Result<Self> {
        let alignment = align(expected, observed);
        let quality_warning = alignment.summary.drop_rate > drop_rate_threshold;
        if quality_warning {
            tracing::warn!(
                drop_rate = alignment.summary.drop_rate,
                threshold = drop_rate_threshold,
                dropped = alignment.summary.dropped,
                expected = alignment.summary.total_expected,
                "drop rate above threshold"
            );
        } else {
            tracing::info!(
                drop_rate = alignment.summary.drop_rate,
                matched = alignment.summary.matched,
                spurious = alignment.summary.spurious,
                "validation complete"
            );
        }
        Ok(Self {
            schema_version: REPORT_SCHEMA.to_string(),
            generated_at: Utc::now(),
            expected_source: source,
            expected_digest: canonical_json_digest(&expected)?,
            observed_digest: canonical_json_digest(&observed)?,
            drop_rate_threshold,
            quality_warning,
            summary: alignment.summary,
            entries: alignment.entries,
        })
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        atomic_write_json_pretty(path, self)
    }
}

/// Which mirror-log rows count as expected. Every attempt counts unless the
/// caller opts into `DispatchedOnly`, so a failed hardware write shows up as
/// a drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorFilter {
    #[default]
    AllAttempts,
    DispatchedOnly,
}

pub fn expected_from_mirror(events: &[TriggerEvent], filter: MirrorFilter) -> Vec<CodeSample> {
    events
        .iter()
        .filter(|e| filter == MirrorFilter::AllAttempts || e.dispatch_success)
        .map(|e| CodeSample::at(e.code, e.logical_time))
        .collect()
}

pub fn expected_from_ground_truth(events: &[ExpectedTrigger]) -> Vec<CodeSample> {
    events.iter().map(|e| CodeSample::untimed(e.code)).collect()
}

pub fn observed_from_recording(samples: &[RecordedSample]) -> Vec<CodeSample> {
    samples.iter().copied().map(CodeSample::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::Classification;
    use std::fs;

    fn event(code: u8, t: f64, ok: bool) -> TriggerEvent {
        TriggerEvent {
            code,
            label: format!("e{}", code),
            logical_time: t,
            absolute_time: "2026-01-26T16:00:00.000Z".to_string(),
            dispatch_success: ok,
        }
    }

    #[test]
    fn failed_dispatches_can_be_excluded() {
        let events = vec![event(1, 0.0, true), event(2, 1.0, false), event(3, 2.0, true)];
        assert_eq!(expected_from_mirror(&events, MirrorFilter::AllAttempts).len(), 3);
        let dispatched = expected_from_mirror(&events, MirrorFilter::DispatchedOnly);
        assert_eq!(
            dispatched.iter().map(|s| s.code).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn failed_dispatches_count_as_drops_by_default() {
        let events = vec![event(1, 0.0, true), event(2, 1.0, false), event(3, 2.0, true)];
        let observed = [CodeSample::untimed(1), CodeSample::untimed(3)];
        let expected = expected_from_mirror(&events, MirrorFilter::default());
        let report =
            ValidationReport::build(&expected, &observed, ExpectedSource::MirrorLog, 0.01).unwrap();
        assert_eq!(report.summary.total_expected, 3);
        assert_eq!(report.summary.dropped, 1);
        assert!(report.quality_warning);
    }

    #[test]
    fn warning_follows_threshold() {
        let expected: Vec<CodeSample> = (1..=100).map(CodeSample::untimed).collect();
        let observed: Vec<CodeSample> = (2..=100).map(CodeSample::untimed).collect();
        let at_threshold =
            ValidationReport::build(&expected, &observed, ExpectedSource::GroundTruth, 0.01)
                .unwrap();
        assert!(!at_threshold.quality_warning);
        let strict =
            ValidationReport::build(&expected, &observed, ExpectedSource::GroundTruth, 0.005)
                .unwrap();
        assert!(strict.quality_warning);
        assert_eq!(at_threshold.expected_digest, strict.expected_digest);
    }

    #[test]
    fn report_round_trips_through_disk() {
        let root = std::env::temp_dir().join(format!(
            "trigsync_report_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("validation.json");
        let expected = [CodeSample::untimed(1), CodeSample::untimed(2)];
        let observed = [CodeSample::untimed(1)];
        let report =
            ValidationReport::build(&expected, &observed, ExpectedSource::MirrorLog, 0.01).unwrap();
        report.write(&path).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["schema_version"], REPORT_SCHEMA);
        assert_eq!(value["expected_source"], "mirror_log");
        assert_eq!(value["summary"]["dropped"], 1);
        assert_eq!(value["entries"].as_array().map(Vec::len), Some(2));
        assert_eq!(value["quality_warning"], true);

        let back: ValidationReport = serde_json::from_value(value).unwrap();
        assert_eq!(back.entries[1].classification, Classification::Dropped);
        let _ = fs::remove_dir_all(root);
    }
}
