//! Stratified, seeded trial sequences and the per-subject protocol document.

use chrono::{Local, NaiveDateTime};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use trigsync_core::{CodeBook, CodeLayout, ConfigError, ConsistencyError, ExperimentConfig};

pub const PROTOCOL_SCHEMA: &str = "protocol_v1";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    A,
    B,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::A => f.write_str("A"),
            Category::B => f.write_str("B"),
        }
    }
}

/// How the concept word is rendered on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Upper,
    Lower,
}

/// `YYYYMMDD_HHMMSS` wall-clock stamp fixed when a subject's protocol is
/// first generated. Part of the seed, so it must never be re-derived.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GenerationStamp(String);

impl GenerationStamp {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        NaiveDateTime::parse_from_str(raw, STAMP_FORMAT).map_err(|e| {
            ConfigError::InvalidField {
                field: "generation_timestamp",
                reason: format!("`{}` is not YYYYMMDD_HHMMSS: {}", raw, e),
            }
        })?;
        Ok(Self(raw.to_string()))
    }

    pub fn now() -> Self {
        Self(Local::now().format(STAMP_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_datetime(&self) -> NaiveDateTime {
        // Checked at construction.
        NaiveDateTime::parse_from_str(&self.0, STAMP_FORMAT).unwrap_or_default()
    }
}

impl TryFrom<String> for GenerationStamp {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GenerationStamp::parse(&value)
    }
}

impl From<GenerationStamp> for String {
    fn from(value: GenerationStamp) -> Self {
        value.0
    }
}

impl fmt::Display for GenerationStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSpec {
    /// 1-based within the block.
    pub trial_index: usize,
    /// 1-based across the whole session.
    pub global_trial_index: usize,
    pub concept: String,
    pub category: Category,
    pub variant: Variant,
}

impl TrialSpec {
    pub fn display_text(&self) -> String {
        match self.variant {
            Variant::Upper => self.concept.to_uppercase(),
            Variant::Lower => self.concept.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSequence {
    /// 0-based, matches the `Block_NNNN` directory.
    pub block_index: usize,
    pub seed: u64,
    pub trials: Vec<TrialSpec>,
}

impl BlockSequence {
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Block number carried by block trigger codes.
    pub fn block_number(&self) -> usize {
        self.block_index + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub concepts_a: Vec<String>,
    pub concepts_b: Vec<String>,
    pub total_trials: usize,
    pub n_blocks: usize,
    pub block_sizes: Vec<usize>,
    pub beeps_per_trial: usize,
    /// Code layout in force when the protocol was generated.
    pub codes: CodeLayout,
}

impl GenerationParameters {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            concepts_a: config.concepts_a.clone(),
            concepts_b: config.concepts_b.clone(),
            total_trials: config.total_trials,
            n_blocks: config.n_blocks,
            block_sizes: config.block_sizes(),
            beeps_per_trial: config.beeps_per_trial,
            codes: config.codes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub schema_version: String,
    pub subject_id: String,
    pub generation_timestamp: GenerationStamp,
    pub created_at: NaiveDateTime,
    pub parameters: GenerationParameters,
    pub blocks: Vec<BlockSequence>,
}

impl Protocol {
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn total_trials(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub fn block(&self, block_index: usize) -> Result<&BlockSequence, ConsistencyError> {
        self.blocks
            .get(block_index)
            .ok_or(ConsistencyError::BlockNotInProtocol {
                requested: block_index,
                available: self.blocks.len(),
            })
    }

    pub fn trials(&self) -> impl Iterator<Item = &TrialSpec> {
        self.blocks.iter().flat_map(|b| b.trials.iter())
    }

    /// Code book rebuilt from the stored layout, independent of any later
    /// config edits.
    pub fn code_book(&self) -> Result<CodeBook, ConfigError> {
        CodeBook::new(&self.parameters.codes)
    }
}

/// Stable per-block seed: SHA-256 of the identity tuple, reduced to 31 bits.
pub fn block_seed(subject_id: &str, stamp: &GenerationStamp, block_index: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}_block{}", subject_id, stamp, block_index).as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % (1u64 << 31)
}

/// Each item appears `floor(n / items)` times; the remainder goes to distinct
/// items drawn without replacement.
fn stratified_items(items: &[String], n: usize, rng: &mut StdRng) -> Vec<String> {
    let per_item = n / items.len();
    let mut out: Vec<String> = items
        .iter()
        .flat_map(|item| std::iter::repeat(item.clone()).take(per_item))
        .collect();
    let remainder = n - out.len();
    if remainder > 0 {
        out.extend(items.choose_multiple(rng, remainder).cloned());
    }
    out
}

fn stratified_variants(n: usize, rng: &mut StdRng) -> Vec<Variant> {
    let mut out: Vec<Variant> = (0..n)
        .map(|i| if i < n / 2 { Variant::Upper } else { Variant::Lower })
        .collect();
    if n % 2 == 1 {
        if let Some(last) = out.last_mut() {
            *last = if rng.gen_bool(0.5) {
                Variant::Upper
            } else {
                Variant::Lower
            };
        }
    }
    out.shuffle(rng);
    out
}

/// Builds one block. Category A takes the odd trial when `n_trials` is odd;
/// categories alternate A, B, A, B with the longer list's tail appended.
pub fn generate_block(
    n_trials: usize,
    concepts_a: &[String],
    concepts_b: &[String],
    block_index: usize,
    subject_id: &str,
    stamp: &GenerationStamp,
    first_global_index: usize,
) -> Result<BlockSequence, ConfigError> {
    if concepts_a.is_empty() || concepts_b.is_empty() {
        return Err(ConfigError::InvalidField {
            field: "concepts",
            reason: "both categories need at least one concept".to_string(),
        });
    }
    let seed = block_seed(subject_id, stamp, block_index);
    let mut rng = StdRng::seed_from_u64(seed);

    let n_a = (n_trials + 1) / 2;
    let n_b = n_trials / 2;
    let mut items_a = stratified_items(concepts_a, n_a, &mut rng);
    let mut items_b = stratified_items(concepts_b, n_b, &mut rng);
    items_a.shuffle(&mut rng);
    items_b.shuffle(&mut rng);
    let variants_a = stratified_variants(n_a, &mut rng);
    let variants_b = stratified_variants(n_b, &mut rng);

    let side_a: Vec<(String, Variant)> = items_a.into_iter().zip(variants_a).collect();
    let side_b: Vec<(String, Variant)> = items_b.into_iter().zip(variants_b).collect();
    let mut trials = Vec::with_capacity(n_trials);
    for i in 0..side_a.len().max(side_b.len()) {
        for (side, category) in [(&side_a, Category::A), (&side_b, Category::B)] {
            if let Some((concept, variant)) = side.get(i) {
                let trial_index = trials.len() + 1;
                trials.push(TrialSpec {
                    trial_index,
                    global_trial_index: first_global_index + trial_index - 1,
                    concept: concept.clone(),
                    category,
                    variant: *variant,
                });
            }
        }
    }

    Ok(BlockSequence {
        block_index,
        seed,
        trials,
    })
}

pub fn assemble_from_parameters(
    parameters: &GenerationParameters,
    subject_id: &str,
    stamp: &GenerationStamp,
) -> Result<Protocol, ConfigError> {
    let mut blocks = Vec::with_capacity(parameters.block_sizes.len());
    let mut next_global = 1;
    for (block_index, &size) in parameters.block_sizes.iter().enumerate() {
        let block = generate_block(
            size,
            &parameters.concepts_a,
            &parameters.concepts_b,
            block_index,
            subject_id,
            stamp,
            next_global,
        )?;
        next_global += block.len();
        blocks.push(block);
    }
    Ok(Protocol {
        schema_version: PROTOCOL_SCHEMA.to_string(),
        subject_id: subject_id.to_string(),
        generation_timestamp: stamp.clone(),
        created_at: stamp.to_datetime(),
        parameters: parameters.clone(),
        blocks,
    })
}

/// Generates every block for a subject. Callers must go through the session
/// tracker so this runs once per subject.
pub fn assemble_protocol(
    config: &ExperimentConfig,
    subject_id: &str,
    stamp: &GenerationStamp,
) -> Result<Protocol, ConfigError> {
    config.validate()?;
    if subject_id.trim().is_empty() {
        return Err(ConfigError::InvalidField {
            field: "subject_id",
            reason: "must not be empty".to_string(),
        });
    }
    let protocol =
        assemble_from_parameters(&GenerationParameters::from_config(config), subject_id, stamp)?;
    tracing::info!(
        subject = subject_id,
        stamp = %stamp,
        blocks = protocol.n_blocks(),
        trials = protocol.total_trials(),
        "generated protocol"
    );
    Ok(protocol)
}

/// Rebuilds the protocol from its own seed inputs and compares block by block.
pub fn verify_reproducible(protocol: &Protocol) -> Result<(), ConsistencyError> {
    let rebuilt = assemble_from_parameters(
        &protocol.parameters,
        &protocol.subject_id,
        &protocol.generation_timestamp,
    )
    .map_err(|_| ConsistencyError::NotReproducible { block: 0 })?;
    for (i, block) in protocol.blocks.iter().enumerate() {
        if rebuilt.blocks.get(i) != Some(block) {
            return Err(ConsistencyError::NotReproducible { block: i });
        }
    }
    if rebuilt.blocks.len() != protocol.blocks.len() {
        return Err(ConsistencyError::NotReproducible {
            block: protocol.blocks.len(),
        });
    }
    Ok(())
}

/// Lists every stratification rule the block breaks; empty means balanced.
pub fn check_block_balance(
    block: &BlockSequence,
    concepts_a: &[String],
    concepts_b: &[String],
) -> Vec<String> {
    let mut issues = Vec::new();
    let count_a = block
        .trials
        .iter()
        .filter(|t| t.category == Category::A)
        .count();
    let count_b = block.len() - count_a;
    if count_a.abs_diff(count_b) > 1 {
        issues.push(format!("unbalanced categories: A={} B={}", count_a, count_b));
    }

    for (i, trial) in block.trials.iter().enumerate() {
        if trial.trial_index != i + 1 {
            issues.push(format!(
                "trial at position {} has index {}",
                i + 1,
                trial.trial_index
            ));
        }
    }

    for (category, concepts, n) in [
        (Category::A, concepts_a, count_a),
        (Category::B, concepts_b, count_b),
    ] {
        let mut counts: BTreeMap<&str, usize> =
            concepts.iter().map(|c| (c.as_str(), 0)).collect();
        let mut upper = 0usize;
        for trial in block.trials.iter().filter(|t| t.category == category) {
            match counts.get_mut(trial.concept.as_str()) {
                Some(count) => *count += 1,
                None => issues.push(format!(
                    "concept `{}` is not in category {}",
                    trial.concept, category
                )),
            }
            if trial.variant == Variant::Upper {
                upper += 1;
            }
        }
        if concepts.is_empty() {
            continue;
        }
        let floor = n / concepts.len();
        let ceil = floor + usize::from(n % concepts.len() != 0);
        for (concept, count) in counts {
            if count < floor || count > ceil {
                issues.push(format!(
                    "concept `{}` appears {} times, expected {}..={}",
                    concept, count, floor, ceil
                ));
            }
        }
        let lower = n - upper;
        if upper.abs_diff(lower) > 1 {
            issues.push(format!(
                "category {} variants unbalanced: upper={} lower={}",
                category, upper, lower
            ));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn stamp() -> GenerationStamp {
        GenerationStamp::parse("20260126_160000").expect("stamp")
    }

    #[test]
    fn stamp_rejects_garbage() {
        assert!(GenerationStamp::parse("2026-01-26").is_err());
        assert!(GenerationStamp::parse("20261326_160000").is_err());
        let json = serde_json::to_string(&stamp()).unwrap();
        assert_eq!(json, "\"20260126_160000\"");
        assert!(serde_json::from_str::<GenerationStamp>("\"nope\"").is_err());
    }

    #[test]
    fn seed_depends_on_every_identity_input() {
        let s = stamp();
        let base = block_seed("9999", &s, 0);
        assert_eq!(base, block_seed("9999", &s, 0));
        assert_ne!(base, block_seed("9999", &s, 1));
        assert_ne!(base, block_seed("9998", &s, 0));
        let other = GenerationStamp::parse("20260126_160001").unwrap();
        assert_ne!(base, block_seed("9999", &other, 0));
        assert!(base < (1 << 31));
    }

    #[test]
    fn block_alternates_categories_and_numbers_trials() {
        let a = words(&["hand", "foot"]);
        let b = words(&["apple", "banana"]);
        let block = generate_block(8, &a, &b, 0, "9999", &stamp(), 1).unwrap();
        assert_eq!(block.len(), 8);
        for (i, trial) in block.trials.iter().enumerate() {
            let expected = if i % 2 == 0 { Category::A } else { Category::B };
            assert_eq!(trial.category, expected);
            assert_eq!(trial.trial_index, i + 1);
            assert_eq!(trial.global_trial_index, i + 1);
        }
        assert!(check_block_balance(&block, &a, &b).is_empty());
    }

    #[test]
    fn odd_block_gives_extra_trial_to_category_a() {
        let a = words(&["hand", "foot", "knee"]);
        let b = words(&["apple", "banana"]);
        let block = generate_block(7, &a, &b, 2, "s1", &stamp(), 21).unwrap();
        let count_a = block
            .trials
            .iter()
            .filter(|t| t.category == Category::A)
            .count();
        assert_eq!(count_a, 4);
        assert_eq!(block.trials.last().unwrap().category, Category::A);
        assert_eq!(block.trials[0].global_trial_index, 21);
        assert_eq!(block.trials[6].global_trial_index, 27);
        assert!(check_block_balance(&block, &a, &b).is_empty());
    }

    #[test]
    fn generation_is_reproducible() {
        let a = words(&["hand", "foot", "elbow", "knee", "shoulder", "wrist"]);
        let b = words(&["apple", "banana", "orange", "grape", "strawberry", "lemon"]);
        let first = generate_block(10, &a, &b, 3, "9999", &stamp(), 31).unwrap();
        let second = generate_block(10, &a, &b, 3, "9999", &stamp(), 31).unwrap();
        assert_eq!(first, second);
        let other_block = generate_block(10, &a, &b, 4, "9999", &stamp(), 31).unwrap();
        assert_ne!(first.seed, other_block.seed);
    }

    #[test]
    fn stratification_holds_across_random_shapes() {
        let pool_a = words(&["hand", "foot", "elbow", "knee", "shoulder", "wrist", "ankle"]);
        let pool_b = words(&["apple", "banana", "orange", "grape", "lemon"]);
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..300 {
            let k_a = rng.gen_range(1..=pool_a.len());
            let k_b = rng.gen_range(1..=pool_b.len());
            let n = rng.gen_range(1..=60);
            let subject = format!("p{}", round);
            let block =
                generate_block(n, &pool_a[..k_a], &pool_b[..k_b], round % 9, &subject, &stamp(), 1)
                    .unwrap();
            assert_eq!(block.len(), n);
            let issues = check_block_balance(&block, &pool_a[..k_a], &pool_b[..k_b]);
            assert!(issues.is_empty(), "n={} k_a={} k_b={}: {:?}", n, k_a, k_b, issues);
        }
    }

    #[test]
    fn protocol_covers_all_trials_and_is_reproducible() {
        let config = ExperimentConfig {
            total_trials: 23,
            n_blocks: 4,
            ..ExperimentConfig::default()
        };
        let protocol = assemble_protocol(&config, "9999", &stamp()).unwrap();
        assert_eq!(protocol.n_blocks(), 4);
        assert_eq!(protocol.total_trials(), 23);
        assert_eq!(protocol.blocks[3].len(), 8);
        let globals: Vec<usize> = protocol.trials().map(|t| t.global_trial_index).collect();
        assert_eq!(globals, (1..=23).collect::<Vec<_>>());
        assert_eq!(
            protocol.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2026-01-26 16:00:00"
        );

        let again = assemble_protocol(&config, "9999", &stamp()).unwrap();
        assert_eq!(
            serde_json::to_vec(&protocol).unwrap(),
            serde_json::to_vec(&again).unwrap()
        );
        verify_reproducible(&protocol).expect("reproducible");

        let mut tampered = protocol.clone();
        tampered.blocks[1].trials.swap(0, 2);
        assert_eq!(
            verify_reproducible(&tampered),
            Err(ConsistencyError::NotReproducible { block: 1 })
        );
    }

    #[test]
    fn unknown_block_is_a_consistency_error() {
        let protocol = assemble_protocol(&ExperimentConfig::default(), "1", &stamp()).unwrap();
        assert!(protocol.block(3).is_ok());
        assert_eq!(
            protocol.block(4),
            Err(ConsistencyError::BlockNotInProtocol {
                requested: 4,
                available: 4
            })
        );
    }
}
