pub mod align;
pub mod audit;
pub mod decode;
pub mod report;
pub mod stats;

pub use align::{
    align, AlignmentEntry, AlignmentSummary, Classification, CodeSample, TimingStats,
    ValidationAlignment,
};
pub use audit::{audit_concepts, parse_concept_label, ConceptAudit, ConceptMismatch};
pub use decode::{
    decode_status_channel, load_recorded_samples, load_status_channel, RecordedSample,
    RecordingError,
};
pub use report::{
    expected_from_ground_truth, expected_from_mirror, observed_from_recording, ExpectedSource,
    MirrorFilter, ValidationReport, REPORT_SCHEMA,
};
pub use stats::{ground_truth_stats, GroundTruthStats};
