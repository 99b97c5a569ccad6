pub mod codes;
pub mod config;
pub mod error;
pub mod fsutil;

pub use codes::{CodeBook, CodeRange, EventKind, TrialCodeScheme};
pub use config::{load_config, CodeLayout, ExperimentConfig, TransportConfig, ValidationConfig};
pub use error::{ConfigError, ConsistencyError};
pub use fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir, sha256_bytes,
};
