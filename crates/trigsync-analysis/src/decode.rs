//! Reading what the recorder actually captured.

use crate::align::CodeSample;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("sample rate must be positive, got {0}")]
    SampleRate(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordedSample {
    pub code: u8,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_index: Option<usize>,
}

impl From<RecordedSample> for CodeSample {
    fn from(sample: RecordedSample) -> Self {
        CodeSample::at(sample.code, sample.time)
    }
}

/// Turns raw status-channel values into trigger onsets. Only the low byte
/// carries trigger bits; an onset is a change to a nonzero value. The line
/// is assumed idle (0) before the first sample.
pub fn decode_status_channel(
    values: &[i64],
    sample_rate: f64,
) -> Result<Vec<RecordedSample>, RecordingError> {
    if !(sample_rate > 0.0 && sample_rate.is_finite()) {
        return Err(RecordingError::SampleRate(sample_rate));
    }
    let mut onsets = Vec::new();
    let mut previous = 0u8;
    for (index, value) in values.iter().enumerate() {
        let code = (value & 0xFF) as u8;
        if code != previous && code != 0 {
            onsets.push(RecordedSample {
                code,
                time: index as f64 / sample_rate,
                sample_index: Some(index),
            });
        }
        previous = code;
    }
    Ok(onsets)
}

fn open_lines(path: &Path) -> Result<impl Iterator<Item = (usize, io::Result<String>)>, RecordingError> {
    let file = File::open(path).map_err(|source| RecordingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file)
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line)))
}

/// One JSON object per line: `{"code": 12, "time": 3.25}`.
pub fn load_recorded_samples(path: &Path) -> Result<Vec<RecordedSample>, RecordingError> {
    let mut samples = Vec::new();
    for (line_no, line) in open_lines(path)? {
        let line = line.map_err(|source| RecordingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let sample = serde_json::from_str(&line).map_err(|e| RecordingError::Parse {
            path: path.to_path_buf(),
            line: line_no,
            reason: e.to_string(),
        })?;
        samples.push(sample);
    }
    Ok(samples)
}

/// Plain text export of the status channel, one integer per line.
pub fn load_status_channel(path: &Path, sample_rate: f64) -> Result<Vec<RecordedSample>, RecordingError> {
    let mut values = Vec::new();
    for (line_no, line) in open_lines(path)? {
        let line = line.map_err(|source| RecordingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let value = trimmed.parse::<i64>().map_err(|e| RecordingError::Parse {
            path: path.to_path_buf(),
            line: line_no,
            reason: e.to_string(),
        })?;
        values.push(value);
    }
    decode_status_channel(&values, sample_rate)
}
