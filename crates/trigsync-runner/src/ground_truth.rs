//! Replays a stored protocol into the trigger sequence a run must emit.

use crate::protocol::{BlockSequence, Category, Protocol, TrialSpec};
use serde::{Deserialize, Serialize};
use trigsync_core::{CodeBook, ConfigError, EventKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedTrigger {
    /// 0-based position in the expanded sequence.
    pub position: usize,
    pub code: u8,
    pub label: String,
    pub kind: EventKind,
    pub block_number: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_trial: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}

struct Expansion<'a> {
    codes: &'a CodeBook,
    out: Vec<ExpectedTrigger>,
}

impl Expansion<'_> {
    fn push(
        &mut self,
        kind: EventKind,
        label: String,
        block_number: usize,
        trial: Option<&TrialSpec>,
    ) -> Result<(), ConfigError> {
        let code = self.codes.code(kind)?;
        self.out.push(ExpectedTrigger {
            position: self.out.len(),
            code,
            label,
            kind,
            block_number,
            global_trial: trial.map(|t| t.global_trial_index),
            concept: trial.map(|t| t.concept.clone()),
            category: trial.map(|t| t.category),
        });
        Ok(())
    }

    fn block(&mut self, block: &BlockSequence, beeps_per_trial: usize) -> Result<(), ConfigError> {
        let n = block.block_number();
        self.push(EventKind::BlockStart(n), format!("block_{}_start", n), n, None)?;
        for trial in &block.trials {
            let g = trial.global_trial_index;
            let code_index = self.codes.trial_code_index(trial.trial_index, g);
            let t = Some(trial);
            self.push(
                EventKind::TrialStart(code_index),
                format!("trial_{}_start", g),
                n,
                t,
            )?;
            self.push(
                EventKind::TrialIndicator,
                format!("trial_indicator_{}", g),
                n,
                t,
            )?;
            let concept_kind = match trial.category {
                Category::A => EventKind::ConceptA,
                Category::B => EventKind::ConceptB,
            };
            self.push(
                concept_kind,
                format!("concept_{}_category_{}", trial.concept, trial.category),
                n,
                t,
            )?;
            self.push(EventKind::Mask, "mask".to_string(), n, t)?;
            self.push(EventKind::Fixation, "fixation".to_string(), n, t)?;
            self.push(EventKind::BeepStart, "beep_start".to_string(), n, t)?;
            for beep in 1..=beeps_per_trial {
                self.push(
                    EventKind::Beep(beep),
                    format!("beep_{}_{}", beep, beeps_per_trial),
                    n,
                    t,
                )?;
            }
            self.push(
                EventKind::TrialEnd(code_index),
                format!("trial_{}_end", g),
                n,
                t,
            )?;
        }
        self.push(EventKind::BlockEnd(n), format!("block_{}_end", n), n, None)
    }
}

/// Events for a single block, positions starting at 0.
pub fn expand_block(
    block: &BlockSequence,
    codes: &CodeBook,
    beeps_per_trial: usize,
) -> Result<Vec<ExpectedTrigger>, ConfigError> {
    let mut expansion = Expansion {
        codes,
        out: Vec::with_capacity(block.len() * (beeps_per_trial + 7) + 2),
    };
    expansion.block(block, beeps_per_trial)?;
    Ok(expansion.out)
}

/// Every block in protocol order. Fails if any index exceeds the code layout.
pub fn expand(
    protocol: &Protocol,
    codes: &CodeBook,
    beeps_per_trial: usize,
) -> Result<Vec<ExpectedTrigger>, ConfigError> {
    let mut expansion = Expansion {
        codes,
        out: Vec::new(),
    };
    for block in &protocol.blocks {
        expansion.block(block, beeps_per_trial)?;
    }
    Ok(expansion.out)
}

/// Expands with the code layout and beep count stored in the protocol.
pub fn expand_protocol(protocol: &Protocol) -> Result<Vec<ExpectedTrigger>, ConfigError> {
    let codes = protocol.code_book()?;
    expand(protocol, &codes, protocol.parameters.beeps_per_trial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{assemble_protocol, GenerationStamp};
    use trigsync_core::{ExperimentConfig, TrialCodeScheme};

    fn config(scheme: TrialCodeScheme) -> ExperimentConfig {
        let mut config = ExperimentConfig {
            concepts_a: vec!["hand".into(), "foot".into()],
            concepts_b: vec!["apple".into(), "banana".into()],
            total_trials: 8,
            n_blocks: 2,
            beeps_per_trial: 4,
            ..ExperimentConfig::default()
        };
        config.codes.trial_scheme = scheme;
        config
    }

    fn protocol(config: &ExperimentConfig) -> Protocol {
        let stamp = GenerationStamp::parse("20260126_160000").unwrap();
        assemble_protocol(config, "9999", &stamp).unwrap()
    }

    #[test]
    fn trial_event_order_and_labels() {
        let config = config(TrialCodeScheme::BlockLocal);
        let codes = config.validate().unwrap();
        let protocol = protocol(&config);
        let events = expand(&protocol, &codes, config.beeps_per_trial).unwrap();
        assert_eq!(events.len(), 2 * (2 + 4 * (7 + 4)));
        assert!(events.iter().enumerate().all(|(i, e)| e.position == i));

        let first = &protocol.blocks[0].trials[0];
        let labels: Vec<&str> = events[..13].iter().map(|e| e.label.as_str()).collect();
        let concept = format!("concept_{}_category_{}", first.concept, first.category);
        assert_eq!(
            labels,
            vec![
                "block_1_start",
                "trial_1_start",
                "trial_indicator_1",
                concept.as_str(),
                "mask",
                "fixation",
                "beep_start",
                "beep_1_4",
                "beep_2_4",
                "beep_3_4",
                "beep_4_4",
                "trial_1_end",
                "trial_2_start",
            ]
        );
        assert_eq!(events[0].code, codes.code(EventKind::BlockStart(1)).unwrap());
        assert_eq!(events.last().unwrap().label, "block_2_end");
        for event in &events {
            assert_eq!(codes.describe(event.code), Some(event.kind));
        }
    }

    #[test]
    fn block_local_codes_repeat_across_blocks() {
        let config = config(TrialCodeScheme::BlockLocal);
        let codes = config.validate().unwrap();
        let protocol = protocol(&config);
        let second = expand_block(&protocol.blocks[1], &codes, 4).unwrap();
        assert_eq!(second[1].label, "trial_5_start");
        assert_eq!(second[1].kind, EventKind::TrialStart(1));
        assert_eq!(second[1].global_trial, Some(5));
    }

    #[test]
    fn global_codes_follow_session_trial_number() {
        let config = config(TrialCodeScheme::GlobalUnique);
        let codes = config.validate().unwrap();
        let protocol = protocol(&config);
        let second = expand_block(&protocol.blocks[1], &codes, 4).unwrap();
        assert_eq!(second[1].kind, EventKind::TrialStart(5));
        assert_eq!(second[0].position, 0);
    }

    #[test]
    fn stored_parameters_drive_the_expansion() {
        let config = config(TrialCodeScheme::BlockLocal);
        let codes = config.validate().unwrap();
        let protocol = protocol(&config);
        let expected = expand(&protocol, &codes, config.beeps_per_trial).unwrap();

        let mut edited = config.clone();
        edited.beeps_per_trial = 6;
        edited.codes.concept_a = 11;
        let edited_codes = edited.validate().unwrap();
        let drifted = expand(&protocol, &edited_codes, edited.beeps_per_trial).unwrap();
        assert_ne!(drifted, expected);

        assert_eq!(expand_protocol(&protocol).unwrap(), expected);
    }

    #[test]
    fn too_many_beeps_is_a_config_error() {
        let config = config(TrialCodeScheme::BlockLocal);
        let codes = config.validate().unwrap();
        let protocol = protocol(&config);
        let max = codes.layout().max_beeps;
        let err = expand(&protocol, &codes, max + 1).unwrap_err();
        assert!(matches!(err, ConfigError::IndexOutOfRange { kind: "beep", .. }));
    }
}
