use serde::Serialize;
use trigsync_runner::{Category, Protocol, TriggerEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConceptMismatch {
    /// 1-based session trial number.
    pub global_trial: usize,
    pub expected: String,
    pub logged: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConceptAudit {
    pub checked: usize,
    pub mismatches: Vec<ConceptMismatch>,
    /// Concept rows beyond the end of the protocol.
    pub extra: usize,
    /// Protocol trials with no concept row yet. Normal for a partial session.
    pub not_yet_run: usize,
}

impl ConceptAudit {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty() && self.extra == 0
    }
}

/// Splits `concept_<word>_category_<A|B>`. The word itself may contain `_`.
pub fn parse_concept_label(label: &str) -> Option<(&str, Category)> {
    let rest = label.strip_prefix("concept_")?;
    let (word, category) = rest.rsplit_once("_category_")?;
    let category = match category {
        "A" => Category::A,
        "B" => Category::B,
        _ => return None,
    };
    Some((word, category))
}

/// Checks that the concepts announced in the mirror log follow the stored
/// protocol trial for trial.
pub fn audit_concepts(protocol: &Protocol, events: &[TriggerEvent]) -> ConceptAudit {
    let logged: Vec<(&str, Category)> = events
        .iter()
        .filter_map(|e| parse_concept_label(&e.label))
        .collect();
    let mut mismatches = Vec::new();
    let mut trials = protocol.trials();
    let mut checked = 0;
    let mut extra = 0;
    for (word, category) in logged {
        let Some(trial) = trials.next() else {
            extra += 1;
            continue;
        };
        checked += 1;
        if trial.concept != word || trial.category != category {
            mismatches.push(ConceptMismatch {
                global_trial: trial.global_trial_index,
                expected: format!("{} ({})", trial.concept, trial.category),
                logged: format!("{} ({})", word, category),
            });
        }
    }
    let not_yet_run = trials.count();
    if !mismatches.is_empty() {
        tracing::warn!(
            mismatches = mismatches.len(),
            "mirror log concepts diverge from protocol"
        );
    }
    ConceptAudit {
        checked,
        mismatches,
        extra,
        not_yet_run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trigsync_core::ExperimentConfig;
    use trigsync_runner::{assemble_protocol, GenerationStamp};

    fn row(label: String) -> TriggerEvent {
        TriggerEvent {
            code: 10,
            label,
            logical_time: 0.0,
            absolute_time: String::new(),
            dispatch_success: true,
        }
    }

    fn protocol() -> Protocol {
        let config = ExperimentConfig {
            total_trials: 6,
            n_blocks: 2,
            ..ExperimentConfig::default()
        };
        let stamp = GenerationStamp::parse("20260126_160000").unwrap();
        assemble_protocol(&config, "7", &stamp).unwrap()
    }

    #[test]
    fn labels_parse_with_underscored_words() {
        assert_eq!(
            parse_concept_label("concept_ice_cream_category_B"),
            Some(("ice_cream", Category::B))
        );
        assert_eq!(parse_concept_label("concept_hand_category_C"), None);
        assert_eq!(parse_concept_label("mask"), None);
    }

    #[test]
    fn partial_session_in_order_is_clean() {
        let protocol = protocol();
        let events: Vec<TriggerEvent> = protocol
            .trials()
            .take(4)
            .flat_map(|t| {
                [
                    row("fixation".to_string()),
                    row(format!("concept_{}_category_{}", t.concept, t.category)),
                ]
            })
            .collect();
        let audit = audit_concepts(&protocol, &events);
        assert!(audit.is_clean());
        assert_eq!(audit.checked, 4);
        assert_eq!(audit.not_yet_run, 2);
    }

    #[test]
    fn swapped_concepts_are_reported() {
        let protocol = protocol();
        let trials: Vec<_> = protocol.trials().cloned().collect();
        let mut events: Vec<TriggerEvent> = trials
            .iter()
            .map(|t| row(format!("concept_{}_category_{}", t.concept, t.category)))
            .collect();
        events.swap(0, 1);
        events.push(row("concept_extra_category_A".to_string()));
        let audit = audit_concepts(&protocol, &events);
        assert_eq!(audit.extra, 1);
        assert_eq!(audit.not_yet_run, 0);
        // Trials 1 and 2 alternate categories, so swapping them always differs.
        assert_eq!(audit.mismatches.len(), 2);
        assert_eq!(audit.mismatches[0].global_trial, 1);
        assert!(!audit.is_clean());
    }
}
