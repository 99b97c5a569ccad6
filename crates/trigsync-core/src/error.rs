use std::path::PathBuf;
use thiserror::Error;

/// Problems with the experiment configuration or the code layout it implies.
/// Always fatal: nothing may be dispatched while one of these is outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("code range `{name}` ({first}..={last}) falls outside the one-byte trigger space")]
    RangeOutOfByte { name: String, first: u32, last: u32 },
    #[error("code ranges `{a}` and `{b}` overlap on codes {codes:?}")]
    RangeOverlap { a: String, b: String, codes: Vec<u8> },
    #[error("{kind} index {index} outside supported range 1..={max}")]
    IndexOutOfRange { kind: &'static str, index: usize, max: usize },
    #[error("failed to read config {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// On-disk session state that cannot be reconciled safely.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("subject dir {subject_dir} has blocks {blocks:?} but no protocol document")]
    MissingProtocol { subject_dir: PathBuf, blocks: Vec<usize> },
    #[error("protocol belongs to subject `{found}`, expected `{expected}`")]
    SubjectMismatch { expected: String, found: String },
    #[error("protocol has {available} blocks, block {requested} was requested")]
    BlockNotInProtocol { requested: usize, available: usize },
    #[error("protocol regenerated from its seed inputs differs from the stored copy at block {block}")]
    NotReproducible { block: usize },
}
