use crate::codes::{CodeBook, TrialCodeScheme};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    #[serde(default = "default_concepts_a")]
    pub concepts_a: Vec<String>,
    #[serde(default = "default_concepts_b")]
    pub concepts_b: Vec<String>,
    #[serde(default = "default_total_trials")]
    pub total_trials: usize,
    #[serde(default = "default_n_blocks")]
    pub n_blocks: usize,
    #[serde(default = "default_beeps_per_trial")]
    pub beeps_per_trial: usize,
    #[serde(default)]
    pub codes: CodeLayout,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Placement of every trigger range in the byte. Indexed ranges start at
/// `base + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CodeLayout {
    pub trial_scheme: TrialCodeScheme,
    /// Per block under `block_local`, per session under `global_unique`.
    pub max_trials: usize,
    pub max_beeps: usize,
    pub max_blocks: usize,
    pub fixation: u8,
    pub trial_indicator: u8,
    pub concept_a: u8,
    pub concept_b: u8,
    pub mask: u8,
    pub beep_start: u8,
    pub beep_base: u8,
    pub block_start_base: u8,
    pub block_end_base: u8,
    pub trial_start_base: u8,
    pub trial_end_base: u8,
}

impl Default for CodeLayout {
    fn default() -> Self {
        Self {
            trial_scheme: TrialCodeScheme::BlockLocal,
            max_trials: 49,
            max_beeps: 8,
            max_blocks: 9,
            fixation: 1,
            trial_indicator: 2,
            concept_a: 10,
            concept_b: 20,
            mask: 25,
            beep_start: 30,
            beep_base: 30,
            block_start_base: 60,
            block_end_base: 70,
            trial_start_base: 100,
            trial_end_base: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransportConfig {
    /// Character device of the trigger interface. `None` runs without
    /// hardware; every send is then logged with `sent_to_eeg = no`.
    pub device: Option<PathBuf>,
    pub settle_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device: None,
            settle_ms: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ValidationConfig {
    pub drop_rate_warning: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            drop_rate_warning: 0.01,
        }
    }
}

fn default_concepts_a() -> Vec<String> {
    ["hand", "foot", "elbow", "knee", "shoulder", "wrist"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_concepts_b() -> Vec<String> {
    ["apple", "banana", "orange", "grape", "strawberry", "lemon"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_total_trials() -> usize {
    40
}

fn default_n_blocks() -> usize {
    4
}

fn default_beeps_per_trial() -> usize {
    8
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            concepts_a: default_concepts_a(),
            concepts_b: default_concepts_b(),
            total_trials: default_total_trials(),
            n_blocks: default_n_blocks(),
            beeps_per_trial: default_beeps_per_trial(),
            codes: CodeLayout::default(),
            transport: TransportConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Trials per block; the last block absorbs the division remainder.
    pub fn block_sizes(&self) -> Vec<usize> {
        if self.n_blocks == 0 {
            return Vec::new();
        }
        let per_block = self.total_trials / self.n_blocks;
        let mut sizes = vec![per_block; self.n_blocks];
        if let Some(last) = sizes.last_mut() {
            *last = self.total_trials - per_block * (self.n_blocks - 1);
        }
        sizes
    }

    /// Checks every field and proves the code layout disjoint. Returns the
    /// code book the rest of the session must use.
    pub fn validate(&self) -> Result<CodeBook, ConfigError> {
        check_concepts("concepts_a", &self.concepts_a)?;
        check_concepts("concepts_b", &self.concepts_b)?;
        if self.n_blocks == 0 {
            return Err(ConfigError::InvalidField {
                field: "n_blocks",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.total_trials < self.n_blocks {
            return Err(ConfigError::InvalidField {
                field: "total_trials",
                reason: format!(
                    "{} trials cannot fill {} blocks",
                    self.total_trials, self.n_blocks
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.validation.drop_rate_warning) {
            return Err(ConfigError::InvalidField {
                field: "validation.drop_rate_warning",
                reason: format!("{} is not a rate", self.validation.drop_rate_warning),
            });
        }

        let book = CodeBook::new(&self.codes)?;
        if self.beeps_per_trial == 0 || self.beeps_per_trial > self.codes.max_beeps {
            return Err(ConfigError::InvalidField {
                field: "beeps_per_trial",
                reason: format!(
                    "{} outside 1..={}",
                    self.beeps_per_trial, self.codes.max_beeps
                ),
            });
        }
        if self.n_blocks > self.codes.max_blocks {
            return Err(ConfigError::InvalidField {
                field: "n_blocks",
                reason: format!(
                    "{} blocks but block codes only cover {}",
                    self.n_blocks, self.codes.max_blocks
                ),
            });
        }
        let trial_span = match self.codes.trial_scheme {
            TrialCodeScheme::BlockLocal => self.block_sizes().into_iter().max().unwrap_or(0),
            TrialCodeScheme::GlobalUnique => self.total_trials,
        };
        if trial_span > self.codes.max_trials {
            return Err(ConfigError::InvalidField {
                field: "total_trials",
                reason: format!(
                    "needs {} trial codes under {:?} but only {} are allocated",
                    trial_span, self.codes.trial_scheme, self.codes.max_trials
                ),
            });
        }
        Ok(book)
    }
}

fn check_concepts(field: &'static str, concepts: &[String]) -> Result<(), ConfigError> {
    if concepts.is_empty() {
        return Err(ConfigError::InvalidField {
            field,
            reason: "needs at least one concept".to_string(),
        });
    }
    let mut seen = BTreeSet::new();
    for concept in concepts {
        if concept.trim().is_empty() {
            return Err(ConfigError::InvalidField {
                field,
                reason: "empty concept label".to_string(),
            });
        }
        if concept.chars().any(char::is_control) {
            return Err(ConfigError::InvalidField {
                field,
                reason: format!("control character in concept {:?}", concept),
            });
        }
        if !seen.insert(concept.as_str()) {
            return Err(ConfigError::InvalidField {
                field,
                reason: format!("duplicate concept `{}`", concept),
            });
        }
    }
    Ok(())
}

/// Reads YAML or JSON (by extension) and validates it before returning.
pub fn load_config(path: &Path) -> Result<ExperimentConfig, ConfigError> {
    let unreadable = |reason: String| ConfigError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };
    let text = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let config: ExperimentConfig = if is_json {
        serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))?
    } else {
        serde_yaml::from_str(&text).map_err(|e| unreadable(e.to_string()))?
    };
    config.validate()?;
    tracing::debug!(
        path = %path.display(),
        blocks = config.n_blocks,
        trials = config.total_trials,
        "loaded experiment config"
    );
    Ok(config)
}
