use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use trigsync_analysis::{
    align, audit_concepts, expected_from_ground_truth, expected_from_mirror, CodeSample,
    ExpectedSource, MirrorFilter, ValidationReport,
};
use trigsync_core::ExperimentConfig;
use trigsync_runner::{
    expand, expand_block, expand_protocol, read_mirror_log, run_block_script, BlockGuard,
    Dispatcher, GenerationStamp, LoopbackPort, MirrorLog, SessionError, SessionTracker, SteppedClock,
};

fn temp_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "trigsync_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

fn two_small_blocks() -> ExperimentConfig {
    ExperimentConfig {
        concepts_a: vec!["hand".into(), "foot".into()],
        concepts_b: vec!["apple".into(), "banana".into()],
        total_trials: 8,
        n_blocks: 2,
        beeps_per_trial: 4,
        ..ExperimentConfig::default()
    }
}

#[test]
fn injected_drop_rate_is_recovered_exactly() {
    let root = temp_root("e2e");
    let config = two_small_blocks();
    let codes = config.validate().unwrap();
    let stamp = GenerationStamp::parse("20260126_160000").unwrap();
    let tracker = SessionTracker::new(&root, "9999");

    let port = LoopbackPort::new().with_drop_every(5);
    let capture = port.capture();
    let mut plan = tracker.prepare_next_block(&config, &stamp).unwrap();
    assert!(plan.generated_protocol);
    let mut dispatcher = Dispatcher::with_clock(
        Some(Box::new(port)),
        MirrorLog::open(&plan.mirror_log).unwrap(),
        Duration::ZERO,
        Box::new(SteppedClock::new(0.0, 0.1)),
    );

    let mut blocks_run = 0;
    loop {
        let mut guard = BlockGuard::start(&plan.storage).unwrap();
        let block = plan.protocol.block(plan.block_index()).unwrap();
        let script = expand_block(block, &codes, config.beeps_per_trial).unwrap();
        assert_eq!(script.len(), 46);
        let summary = run_block_script(&mut dispatcher, &script).unwrap();
        assert_eq!(summary.sent, 46);
        assert_eq!(summary.failed, 0);
        guard.complete(summary.sent).unwrap();
        blocks_run += 1;

        match tracker.prepare_next_block(&config, &stamp) {
            Ok(next) => {
                assert!(!next.generated_protocol);
                plan = next;
            }
            Err(SessionError::AllBlocksCompleted { n_blocks, .. }) => {
                assert_eq!(n_blocks, 2);
                break;
            }
            Err(err) => panic!("unexpected session error: {}", err),
        }
    }
    assert_eq!(blocks_run, 2);
    dispatcher.close().unwrap();

    let records = read_mirror_log(&plan.mirror_log).unwrap();
    assert!(records.malformed.is_empty());
    let mirror = records.events;
    assert_eq!(mirror.len(), 92);
    assert!(mirror.iter().all(|e| e.dispatch_success));

    let ground_truth = expand(&plan.protocol, &codes, config.beeps_per_trial).unwrap();
    assert_eq!(expand_protocol(&plan.protocol).unwrap(), ground_truth);
    let oracle = expected_from_ground_truth(&ground_truth);
    let from_mirror = expected_from_mirror(&mirror, MirrorFilter::default());
    assert_eq!(
        oracle.iter().map(|s| s.code).collect::<Vec<_>>(),
        from_mirror.iter().map(|s| s.code).collect::<Vec<_>>()
    );

    let observed: Vec<CodeSample> = capture
        .bytes()
        .into_iter()
        .map(CodeSample::untimed)
        .collect();
    assert_eq!(observed.len(), 92 - 18);

    let alignment = align(&oracle, &observed);
    assert_eq!(alignment.summary.dropped, 18);
    assert_eq!(alignment.summary.matched, 74);
    assert_eq!(alignment.summary.spurious, 0);
    assert_eq!(alignment.summary.drop_rate, 18.0 / 92.0);

    let report = ValidationReport::build(
        &from_mirror,
        &observed,
        ExpectedSource::MirrorLog,
        config.validation.drop_rate_warning,
    )
    .unwrap();
    assert_eq!(report.summary.drop_rate, 18.0 / 92.0);
    assert!(report.quality_warning);
    report.write(&plan.subject_dir.join("validation.json")).unwrap();

    let audit = audit_concepts(&plan.protocol, &mirror);
    assert!(audit.is_clean());
    assert_eq!(audit.checked, 8);

    let _ = std::fs::remove_dir_all(&root);
}
