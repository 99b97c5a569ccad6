//! Subject/block layout on disk and the resume state machine.
//!
//! ```text
//! <results>/sub-<id>_<YYYYMMDD_HHMMSS>/
//!     sub-<id>_<stamp>_protocol.json
//!     sub-<id>_<stamp>_triggers.csv
//!     Block_0000/  block_state.json  block_complete.json
//!     Block_0001/  ...
//! ```
//!
//! Nothing here is cached in memory: every decision is re-derived from what
//! exists on disk, so a restarted process lands in the same state.

use crate::protocol::{
    assemble_protocol, GenerationParameters, GenerationStamp, Protocol, TrialSpec,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use trigsync_core::{
    atomic_write_json_pretty, ensure_dir, ConfigError, ConsistencyError, ExperimentConfig,
};
use walkdir::WalkDir;

const BLOCK_PREFIX: &str = "Block_";
const BLOCK_STATE_FILE: &str = "block_state.json";
const BLOCK_COMPLETE_FILE: &str = "block_complete.json";
const PROTOCOL_SUFFIX: &str = "_protocol.json";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("all {n_blocks} blocks already exist for subject `{subject_id}`; use a new subject id")]
    AllBlocksCompleted { subject_id: String, n_blocks: usize },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol document is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn subject_dir_name(subject_id: &str, stamp: &GenerationStamp) -> String {
    format!("sub-{}_{}", subject_id, stamp)
}

fn stamp_from_dir_name(name: &str, subject_id: &str) -> Option<GenerationStamp> {
    let rest = name.strip_prefix(&format!("sub-{}_", subject_id))?;
    GenerationStamp::parse(rest).ok()
}

/// Subject directories for `subject_id`, newest stamp first.
pub fn find_subject_dirs(
    results_dir: &Path,
    subject_id: &str,
) -> io::Result<Vec<(GenerationStamp, PathBuf)>> {
    if !results_dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(results_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if let Some(stamp) = stamp_from_dir_name(&name, subject_id) {
            found.push((stamp, entry.path().to_path_buf()));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found)
}

pub fn block_dir(subject_dir: &Path, block_index: usize) -> PathBuf {
    subject_dir.join(format!("{}{:04}", BLOCK_PREFIX, block_index))
}

fn parse_block_dir_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(BLOCK_PREFIX)?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Every `Block_NNNN` directory, finished or not, in ascending order.
pub fn find_existing_blocks(subject_dir: &Path) -> io::Result<Vec<usize>> {
    if !subject_dir.exists() {
        return Ok(Vec::new());
    }
    let mut blocks = Vec::new();
    for entry in WalkDir::new(subject_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_dir() {
            if let Some(index) = parse_block_dir_name(&entry.file_name().to_string_lossy()) {
                blocks.push(index);
            }
        }
    }
    blocks.sort_unstable();
    Ok(blocks)
}

/// 0 for a fresh subject, otherwise one past the highest existing block.
/// Gaps are never back-filled.
pub fn next_block_index(subject_dir: &Path) -> io::Result<usize> {
    Ok(find_existing_blocks(subject_dir)?
        .last()
        .map(|max| max + 1)
        .unwrap_or(0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStorage {
    pub block_index: usize,
    pub dir: PathBuf,
}

impl BlockStorage {
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(BLOCK_STATE_FILE)
    }

    pub fn complete_marker(&self) -> PathBuf {
        self.dir.join(BLOCK_COMPLETE_FILE)
    }

    pub fn is_complete(&self) -> bool {
        self.complete_marker().exists()
    }
}

pub fn ensure_block_storage(subject_dir: &Path, block_index: usize) -> io::Result<BlockStorage> {
    let dir = block_dir(subject_dir, block_index);
    ensure_dir(&dir)?;
    Ok(BlockStorage { block_index, dir })
}

pub fn protocol_path(subject_dir: &Path, subject_id: &str, stamp: &GenerationStamp) -> PathBuf {
    subject_dir.join(format!("sub-{}_{}{}", subject_id, stamp, PROTOCOL_SUFFIX))
}

pub fn mirror_log_path(subject_dir: &Path, subject_id: &str, stamp: &GenerationStamp) -> PathBuf {
    subject_dir.join(format!("sub-{}_{}_triggers.csv", subject_id, stamp))
}

pub fn save_protocol(subject_dir: &Path, protocol: &Protocol) -> Result<PathBuf, SessionError> {
    let path = protocol_path(
        subject_dir,
        &protocol.subject_id,
        &protocol.generation_timestamp,
    );
    atomic_write_json_pretty(&path, protocol)?;
    tracing::info!(path = %path.display(), "saved protocol");
    Ok(path)
}

/// `Ok(None)` when the subject has no protocol document yet.
pub fn load_protocol(subject_dir: &Path, subject_id: &str) -> Result<Option<Protocol>, SessionError> {
    let prefix = format!("sub-{}_", subject_id);
    let mut candidates = Vec::new();
    if subject_dir.exists() {
        for entry in WalkDir::new(subject_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().is_file()
                && name.starts_with(&prefix)
                && name.ends_with(PROTOCOL_SUFFIX)
            {
                candidates.push(entry.path().to_path_buf());
            }
        }
    }
    candidates.sort();
    let Some(path) = candidates.pop() else {
        return Ok(None);
    };
    let bytes = fs::read(&path)?;
    let protocol: Protocol = serde_json::from_slice(&bytes)?;
    if protocol.subject_id != subject_id {
        return Err(ConsistencyError::SubjectMismatch {
            expected: subject_id.to_string(),
            found: protocol.subject_id,
        }
        .into());
    }
    Ok(Some(protocol))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "block")]
pub enum SessionPhase {
    NoProtocol,
    ProtocolGenerated,
    BlockRunning(usize),
    BlockComplete(usize),
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub subject_id: String,
    pub subject_dir: PathBuf,
    pub existing_blocks: Vec<usize>,
    pub next_block: usize,
    pub protocol: Option<Protocol>,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match (self.existing_blocks.last(), &self.protocol) {
            (None, None) => SessionPhase::NoProtocol,
            (None, Some(_)) => SessionPhase::ProtocolGenerated,
            (Some(&last), _) => {
                if block_dir(&self.subject_dir, last)
                    .join(BLOCK_COMPLETE_FILE)
                    .exists()
                {
                    SessionPhase::BlockComplete(last)
                } else {
                    SessionPhase::BlockRunning(last)
                }
            }
        }
    }

    pub fn remaining_blocks(&self) -> Option<usize> {
        self.protocol
            .as_ref()
            .map(|p| p.n_blocks().saturating_sub(self.next_block))
    }
}

/// Reads the subject directory from scratch. Blocks without a protocol are a
/// hard error: what was shown can no longer be established.
pub fn scan_session(subject_dir: &Path, subject_id: &str) -> Result<SessionState, SessionError> {
    let existing_blocks = find_existing_blocks(subject_dir)?;
    let protocol = load_protocol(subject_dir, subject_id)?;
    if protocol.is_none() && !existing_blocks.is_empty() {
        return Err(ConsistencyError::MissingProtocol {
            subject_dir: subject_dir.to_path_buf(),
            blocks: existing_blocks,
        }
        .into());
    }
    let next_block = existing_blocks.last().map(|m| m + 1).unwrap_or(0);
    Ok(SessionState {
        subject_id: subject_id.to_string(),
        subject_dir: subject_dir.to_path_buf(),
        existing_blocks,
        next_block,
        protocol,
    })
}

#[derive(Debug, Clone)]
pub struct BlockPlan {
    pub subject_dir: PathBuf,
    pub storage: BlockStorage,
    pub protocol: Protocol,
    pub mirror_log: PathBuf,
    pub generated_protocol: bool,
}

impl BlockPlan {
    pub fn block_index(&self) -> usize {
        self.storage.block_index
    }

    pub fn trials(&self) -> &[TrialSpec] {
        self.protocol
            .blocks
            .get(self.storage.block_index)
            .map(|b| b.trials.as_slice())
            .unwrap_or(&[])
    }
}

pub struct SessionTracker {
    results_dir: PathBuf,
    subject_id: String,
}

impl SessionTracker {
    pub fn new(results_dir: &Path, subject_id: &str) -> Self {
        Self {
            results_dir: results_dir.to_path_buf(),
            subject_id: subject_id.to_string(),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Latest existing subject directory, if any.
    pub fn current_subject_dir(&self) -> io::Result<Option<(GenerationStamp, PathBuf)>> {
        Ok(find_subject_dirs(&self.results_dir, &self.subject_id)?
            .into_iter()
            .next())
    }

    pub fn state(&self) -> Result<Option<SessionState>, SessionError> {
        match self.current_subject_dir()? {
            Some((_, dir)) => Ok(Some(scan_session(&dir, &self.subject_id)?)),
            None => Ok(None),
        }
    }

    /// Moves the session forward by one block: generates and persists the
    /// protocol on first use, otherwise reloads it, then creates the next
    /// block directory. `stamp` is only used when no subject directory exists.
    pub fn prepare_next_block(
        &self,
        config: &ExperimentConfig,
        stamp: &GenerationStamp,
    ) -> Result<BlockPlan, SessionError> {
        config.validate()?;
        let (stamp, subject_dir) = match self.current_subject_dir()? {
            Some(found) => found,
            None => {
                let dir = self
                    .results_dir
                    .join(subject_dir_name(&self.subject_id, stamp));
                ensure_dir(&dir)?;
                tracing::info!(dir = %dir.display(), "created subject dir");
                (stamp.clone(), dir)
            }
        };

        let state = scan_session(&subject_dir, &self.subject_id)?;
        let (protocol, generated_protocol) = match state.protocol {
            Some(protocol) => {
                if protocol.parameters != GenerationParameters::from_config(config) {
                    tracing::warn!(
                        subject = %self.subject_id,
                        "config differs from stored protocol; the stored protocol is used"
                    );
                }
                (protocol, false)
            }
            None => {
                let protocol = assemble_protocol(config, &self.subject_id, &stamp)?;
                save_protocol(&subject_dir, &protocol)?;
                (protocol, true)
            }
        };

        if state.next_block >= protocol.n_blocks() {
            return Err(SessionError::AllBlocksCompleted {
                subject_id: self.subject_id.clone(),
                n_blocks: protocol.n_blocks(),
            });
        }
        protocol.block(state.next_block)?;
        let storage = ensure_block_storage(&subject_dir, state.next_block)?;
        tracing::info!(
            subject = %self.subject_id,
            block = storage.block_index,
            dir = %storage.dir.display(),
            "prepared block"
        );
        Ok(BlockPlan {
            mirror_log: mirror_log_path(&subject_dir, &self.subject_id, &stamp),
            subject_dir,
            storage,
            protocol,
            generated_protocol,
        })
    }
}

fn write_block_state(storage: &BlockStorage, status: &str, detail: Option<&str>) -> io::Result<()> {
    let payload = json!({
        "schema_version": "block_state_v1",
        "block_index": storage.block_index,
        "status": status,
        "detail": detail,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&storage.state_path(), &payload)
}

/// Marks a block `running` on creation and `aborted` on drop unless
/// `complete` was called first.
pub struct BlockGuard {
    storage: BlockStorage,
    done: bool,
}

impl BlockGuard {
    pub fn start(storage: &BlockStorage) -> io::Result<Self> {
        write_block_state(storage, "running", None)?;
        Ok(Self {
            storage: storage.clone(),
            done: false,
        })
    }

    pub fn complete(&mut self, triggers_sent: usize) -> io::Result<()> {
        write_block_state(&self.storage, "complete", None)?;
        atomic_write_json_pretty(
            &self.storage.complete_marker(),
            &json!({
                "schema_version": "block_complete_v1",
                "block_index": self.storage.block_index,
                "triggers_sent": triggers_sent,
                "completed_at": Utc::now().to_rfc3339(),
            }),
        )?;
        self.done = true;
        Ok(())
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_block_state(&self.storage, "aborted", Some("dropped before completion"));
        }
    }
}
