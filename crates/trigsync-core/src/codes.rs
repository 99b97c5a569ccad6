//! Mapping from experiment events to one-byte trigger codes.
//!
//! Every event kind owns a contiguous range inside `1..=255` (0 is the idle
//! level of the recorder's status line and is never allocated). A `CodeBook`
//! can only be built from a layout whose ranges are pairwise disjoint, so any
//! code it hands out identifies exactly one event kind.

use crate::config::CodeLayout;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How per-trial codes are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialCodeScheme {
    /// Codes restart at 1 in every block; a trial code alone does not say
    /// which block it came from.
    BlockLocal,
    /// Codes follow the session-wide trial number; the session length is
    /// bounded by the trial range size.
    GlobalUnique,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum EventKind {
    Fixation,
    TrialIndicator,
    ConceptA,
    ConceptB,
    Mask,
    BeepStart,
    Beep(usize),
    BlockStart(usize),
    BlockEnd(usize),
    TrialStart(usize),
    TrialEnd(usize),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Fixation => "fixation",
            EventKind::TrialIndicator => "trial_indicator",
            EventKind::ConceptA => "concept_a",
            EventKind::ConceptB => "concept_b",
            EventKind::Mask => "mask",
            EventKind::BeepStart => "beep_start",
            EventKind::Beep(_) => "beep",
            EventKind::BlockStart(_) => "block_start",
            EventKind::BlockEnd(_) => "block_end",
            EventKind::TrialStart(_) => "trial_start",
            EventKind::TrialEnd(_) => "trial_end",
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            EventKind::Beep(i)
            | EventKind::BlockStart(i)
            | EventKind::BlockEnd(i)
            | EventKind::TrialStart(i)
            | EventKind::TrialEnd(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(i) => write!(f, "{}_{}", self.name(), i),
            None => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodeRange {
    pub name: &'static str,
    pub first: u32,
    pub len: u32,
}

impl CodeRange {
    fn single(name: &'static str, code: u8) -> Self {
        Self {
            name,
            first: code as u32,
            len: 1,
        }
    }

    /// Range of `len` codes following `base`, i.e. index 1 maps to `base + 1`.
    fn indexed(name: &'static str, base: u8, len: usize) -> Self {
        Self {
            name,
            first: base as u32 + 1,
            len: len as u32,
        }
    }

    pub fn last(&self) -> u32 {
        self.first + self.len.saturating_sub(1)
    }

    pub fn contains(&self, code: u32) -> bool {
        self.len > 0 && code >= self.first && code <= self.last()
    }

    fn overlap(&self, other: &CodeRange) -> Vec<u8> {
        if self.len == 0 || other.len == 0 {
            return Vec::new();
        }
        let lo = self.first.max(other.first);
        let hi = self.last().min(other.last());
        (lo..=hi).filter_map(|c| u8::try_from(c).ok()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CodeUsage {
    pub allocated: usize,
    pub available: usize,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeBook {
    layout: CodeLayout,
    ranges: Vec<CodeRange>,
}

impl CodeBook {
    pub fn new(layout: &CodeLayout) -> Result<Self, ConfigError> {
        // Every index must fit the byte before any range arithmetic.
        for (field, max) in [
            ("codes.max_beeps", layout.max_beeps),
            ("codes.max_blocks", layout.max_blocks),
            ("codes.max_trials", layout.max_trials),
        ] {
            if max == 0 || max > u8::MAX as usize {
                return Err(ConfigError::InvalidField {
                    field,
                    reason: format!("{} outside 1..={}", max, u8::MAX),
                });
            }
        }
        let ranges = vec![
            CodeRange::single("fixation", layout.fixation),
            CodeRange::single("trial_indicator", layout.trial_indicator),
            CodeRange::single("concept_a", layout.concept_a),
            CodeRange::single("concept_b", layout.concept_b),
            CodeRange::single("mask", layout.mask),
            CodeRange::single("beep_start", layout.beep_start),
            CodeRange::indexed("beep", layout.beep_base, layout.max_beeps),
            CodeRange::indexed("block_start", layout.block_start_base, layout.max_blocks),
            CodeRange::indexed("block_end", layout.block_end_base, layout.max_blocks),
            CodeRange::indexed("trial_start", layout.trial_start_base, layout.max_trials),
            CodeRange::indexed("trial_end", layout.trial_end_base, layout.max_trials),
        ];

        for range in &ranges {
            if range.first == 0 || range.last() > u8::MAX as u32 {
                return Err(ConfigError::RangeOutOfByte {
                    name: range.name.to_string(),
                    first: range.first,
                    last: range.last(),
                });
            }
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                let codes = a.overlap(b);
                if !codes.is_empty() {
                    return Err(ConfigError::RangeOverlap {
                        a: a.name.to_string(),
                        b: b.name.to_string(),
                        codes,
                    });
                }
            }
        }

        Ok(Self {
            layout: layout.clone(),
            ranges,
        })
    }

    pub fn layout(&self) -> &CodeLayout {
        &self.layout
    }

    pub fn scheme(&self) -> TrialCodeScheme {
        self.layout.trial_scheme
    }

    pub fn ranges(&self) -> &[CodeRange] {
        &self.ranges
    }

    pub fn code(&self, kind: EventKind) -> Result<u8, ConfigError> {
        let l = &self.layout;
        match kind {
            EventKind::Fixation => Ok(l.fixation),
            EventKind::TrialIndicator => Ok(l.trial_indicator),
            EventKind::ConceptA => Ok(l.concept_a),
            EventKind::ConceptB => Ok(l.concept_b),
            EventKind::Mask => Ok(l.mask),
            EventKind::BeepStart => Ok(l.beep_start),
            EventKind::Beep(i) => offset_code("beep", l.beep_base, i, l.max_beeps),
            EventKind::BlockStart(b) => {
                offset_code("block", l.block_start_base, b, l.max_blocks)
            }
            EventKind::BlockEnd(b) => offset_code("block", l.block_end_base, b, l.max_blocks),
            EventKind::TrialStart(t) => {
                offset_code("trial", l.trial_start_base, t, l.max_trials)
            }
            EventKind::TrialEnd(t) => offset_code("trial", l.trial_end_base, t, l.max_trials),
        }
    }

    /// Index used for trial codes under the active scheme.
    pub fn trial_code_index(&self, block_local: usize, global: usize) -> usize {
        match self.layout.trial_scheme {
            TrialCodeScheme::BlockLocal => block_local,
            TrialCodeScheme::GlobalUnique => global,
        }
    }

    /// Reverse lookup. Trial codes resolve to the index the scheme encodes,
    /// which is block-local under `BlockLocal`.
    pub fn describe(&self, code: u8) -> Option<EventKind> {
        let code = code as u32;
        let range = self.ranges.iter().find(|r| r.contains(code))?;
        let index = (code - range.first + 1) as usize;
        let kind = match range.name {
            "fixation" => EventKind::Fixation,
            "trial_indicator" => EventKind::TrialIndicator,
            "concept_a" => EventKind::ConceptA,
            "concept_b" => EventKind::ConceptB,
            "mask" => EventKind::Mask,
            "beep_start" => EventKind::BeepStart,
            "beep" => EventKind::Beep(index),
            "block_start" => EventKind::BlockStart(index),
            "block_end" => EventKind::BlockEnd(index),
            "trial_start" => EventKind::TrialStart(index),
            "trial_end" => EventKind::TrialEnd(index),
            _ => return None,
        };
        Some(kind)
    }

    pub fn usage(&self) -> CodeUsage {
        let allocated: usize = self.ranges.iter().map(|r| r.len as usize).sum();
        let available = u8::MAX as usize;
        CodeUsage {
            allocated,
            available,
            fraction: allocated as f64 / available as f64,
        }
    }
}

fn offset_code(kind: &'static str, base: u8, index: usize, max: usize) -> Result<u8, ConfigError> {
    if index == 0 || index > max {
        return Err(ConfigError::IndexOutOfRange { kind, index, max });
    }
    u8::try_from(base as usize + index).map_err(|_| ConfigError::IndexOutOfRange {
        kind,
        index,
        max,
    })
}
