use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use trigsync_analysis as analysis;
use trigsync_core::{atomic_write_json_pretty, load_config, ExperimentConfig};
use trigsync_runner as runner;

#[derive(Parser)]
#[command(name = "trig", version, about = "Trigger-synchronised experiment protocols")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SessionArgs {
    /// Directory holding `sub-<id>_<stamp>` subject directories.
    #[arg(long)]
    results: PathBuf,
    #[arg(long)]
    subject: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the trigger code layout and prove it collision-free.
    Codes {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Generate the protocol if needed and create the next block directory.
    InitBlock {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        json: bool,
    },
    Protocol {
        #[command(flatten)]
        session: SessionArgs,
        /// Regenerate from the stored seed inputs and compare.
        #[arg(long)]
        verify: bool,
        #[arg(long)]
        json: bool,
    },
    /// Expand the stored protocol with the code layout it was generated under.
    GroundTruth {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run the next block's trigger script without stimulus presentation.
    Simulate {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Send to the configured device instead of the in-memory loopback.
        #[arg(long)]
        hardware: bool,
        #[arg(long, default_value_t = 0)]
        drop_every: usize,
        #[arg(long, default_value_t = 0)]
        fail_every: usize,
        #[arg(long)]
        json: bool,
    },
    Validate {
        /// JSONL of `{code, time}` onsets.
        #[arg(long)]
        recording: Option<PathBuf>,
        /// Raw status channel, one integer per line.
        #[arg(long)]
        status_channel: Option<PathBuf>,
        #[arg(long, default_value_t = 2048.0)]
        sample_rate: f64,
        /// Compare against the mirror log instead of the regenerated ground truth.
        #[arg(long)]
        mirror: Option<PathBuf>,
        /// Drop mirror rows whose hardware write failed. By default they count
        /// as expected, so a failed write shows up as a drop.
        #[arg(long)]
        dispatched_only: bool,
        #[arg(long)]
        results: Option<PathBuf>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Check the mirror log's concept sequence against the protocol.
    Audit {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Codes { config, json } => {
            let config = experiment_config(config.as_deref())?;
            let codes = config.validate()?;
            let usage = codes.usage();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "codes",
                    "trial_scheme": codes.scheme(),
                    "ranges": codes.ranges(),
                    "usage": usage,
                })));
            }
            println!("trial_scheme: {:?}", codes.scheme());
            for range in codes.ranges() {
                if range.len == 1 {
                    println!("{}: {}", range.name, range.first);
                } else {
                    println!("{}: {}..={}", range.name, range.first, range.last());
                }
            }
            println!(
                "allocated: {}/{} ({:.1}%)",
                usage.allocated,
                usage.available,
                usage.fraction * 100.0
            );
        }
        Commands::InitBlock {
            session,
            config,
            json,
        } => {
            let config = experiment_config(config.as_deref())?;
            let tracker = runner::SessionTracker::new(&session.results, &session.subject);
            let plan = tracker.prepare_next_block(&config, &runner::GenerationStamp::now())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init-block",
                    "plan": plan_to_json(&plan),
                    "trials": plan.trials(),
                })));
            }
            print_plan(&plan);
            for trial in plan.trials() {
                println!(
                    "  {:>3} (#{:>3}) {} {}",
                    trial.trial_index,
                    trial.global_trial_index,
                    trial.category,
                    trial.display_text()
                );
            }
        }
        Commands::Status { session, json } => {
            let state = session_state(&session)?;
            let phase = state.phase();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "subject_dir": state.subject_dir.display().to_string(),
                    "phase": phase,
                    "existing_blocks": state.existing_blocks,
                    "next_block": state.next_block,
                    "remaining_blocks": state.remaining_blocks(),
                })));
            }
            println!("subject_dir: {}", state.subject_dir.display());
            println!("phase: {:?}", phase);
            println!("existing_blocks: {:?}", state.existing_blocks);
            println!("next_block: {}", state.next_block);
            if let Some(remaining) = state.remaining_blocks() {
                println!("remaining_blocks: {}", remaining);
            }
        }
        Commands::Protocol {
            session,
            verify,
            json,
        } => {
            let state = session_state(&session)?;
            let protocol = stored_protocol(&state)?;
            let issues: Vec<Value> = protocol
                .blocks
                .iter()
                .map(|block| {
                    json!({
                        "block_index": block.block_index,
                        "issues": runner::check_block_balance(
                            block,
                            &protocol.parameters.concepts_a,
                            &protocol.parameters.concepts_b,
                        ),
                    })
                })
                .collect();
            let reproducible = if verify {
                Some(runner::verify_reproducible(protocol).map_err(|e| e.to_string()))
            } else {
                None
            };
            if json {
                return Ok(Some(json!({
                    "ok": reproducible.as_ref().map_or(true, |r| r.is_ok()),
                    "command": "protocol",
                    "protocol": protocol,
                    "balance": issues,
                    "reproducible": reproducible.as_ref().map(|r| r.is_ok()),
                    "reproducible_error": reproducible.as_ref().and_then(|r| r.as_ref().err()),
                })));
            }
            println!("subject: {}", protocol.subject_id);
            println!("generation_timestamp: {}", protocol.generation_timestamp);
            println!("blocks: {}", protocol.n_blocks());
            println!("total_trials: {}", protocol.total_trials());
            for block in &protocol.blocks {
                println!(
                    "block {} (seed {}): {} trials",
                    block.block_index,
                    block.seed,
                    block.len()
                );
                for issue in runner::check_block_balance(
                    block,
                    &protocol.parameters.concepts_a,
                    &protocol.parameters.concepts_b,
                ) {
                    println!("  warning: {}", issue);
                }
            }
            match reproducible {
                Some(Ok(())) => println!("reproducible: yes"),
                Some(Err(reason)) => bail!("protocol is not reproducible: {}", reason),
                None => {}
            }
        }
        Commands::GroundTruth { session, out, json } => {
            let state = session_state(&session)?;
            let events = runner::expand_protocol(stored_protocol(&state)?)?;
            let stats = analysis::ground_truth_stats(&events);
            if let Some(path) = &out {
                atomic_write_json_pretty(path, &events)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "ground-truth",
                    "stats": stats,
                    "out": out.as_ref().map(|p| p.display().to_string()),
                })));
            }
            println!("events: {}", stats.total);
            println!("trials: {}", stats.trials);
            println!("distinct_codes: {}", stats.distinct_codes);
            for (kind, count) in &stats.per_kind {
                println!("  {}: {}", kind, count);
            }
            if let Some(path) = &out {
                println!("written: {}", path.display());
            }
        }
        Commands::Simulate {
            session,
            config,
            hardware,
            drop_every,
            fail_every,
            json,
        } => {
            let config = experiment_config(config.as_deref())?;
            let outcome = simulate_block(&session, &config, hardware, drop_every, fail_every)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "simulate",
                    "plan": plan_to_json(&outcome.plan),
                    "sent": outcome.summary.sent,
                    "delivered": outcome.summary.delivered,
                    "failed": outcome.summary.failed,
                    "recording": outcome.recording.as_ref().map(|p| p.display().to_string()),
                })));
            }
            print_plan(&outcome.plan);
            println!("sent: {}", outcome.summary.sent);
            println!("delivered: {}", outcome.summary.delivered);
            println!("failed: {}", outcome.summary.failed);
            if let Some(path) = &outcome.recording {
                println!("recording: {}", path.display());
            }
        }
        Commands::Validate {
            recording,
            status_channel,
            sample_rate,
            mirror,
            dispatched_only,
            results,
            subject,
            config,
            out,
            json,
        } => {
            let config = experiment_config(config.as_deref())?;
            let recorded = match (&recording, &status_channel) {
                (Some(path), None) => analysis::load_recorded_samples(path)?,
                (None, Some(path)) => analysis::load_status_channel(path, sample_rate)?,
                _ => bail!("pass exactly one of --recording or --status-channel"),
            };
            let mut malformed_rows = Vec::new();
            let (expected, source) = match (&mirror, results, subject) {
                (Some(path), _, _) => {
                    let records = runner::read_mirror_log(path)?;
                    let filter = if dispatched_only {
                        analysis::MirrorFilter::DispatchedOnly
                    } else {
                        analysis::MirrorFilter::AllAttempts
                    };
                    malformed_rows = records.malformed;
                    (
                        analysis::expected_from_mirror(&records.events, filter),
                        analysis::ExpectedSource::MirrorLog,
                    )
                }
                (None, Some(results), Some(subject)) => {
                    let state = session_state(&SessionArgs { results, subject })?;
                    let events = runner::expand_protocol(stored_protocol(&state)?)?;
                    (
                        analysis::expected_from_ground_truth(&events),
                        analysis::ExpectedSource::GroundTruth,
                    )
                }
                _ => bail!("pass --mirror, or --results and --subject to regenerate ground truth"),
            };
            let report = analysis::ValidationReport::build(
                &expected,
                &analysis::observed_from_recording(&recorded),
                source,
                config.validation.drop_rate_warning,
            )?;
            if let Some(path) = &out {
                report.write(path)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "malformed_mirror_rows": malformed_rows,
                    "report": report,
                })));
            }
            if !malformed_rows.is_empty() {
                println!("malformed_mirror_rows: {:?}", malformed_rows);
            }
            print_report(&report);
            if let Some(path) = &out {
                println!("written: {}", path.display());
            }
        }
        Commands::Audit { session, json } => {
            let state = session_state(&session)?;
            let protocol = stored_protocol(&state)?;
            let mirror = runner::session::mirror_log_path(
                &state.subject_dir,
                &protocol.subject_id,
                &protocol.generation_timestamp,
            );
            if !mirror.exists() {
                bail!("no mirror log at {}", mirror.display());
            }
            let records = runner::read_mirror_log(&mirror)?;
            let audit = analysis::audit_concepts(protocol, &records.events);
            if json {
                return Ok(Some(json!({
                    "ok": audit.is_clean(),
                    "command": "audit",
                    "mirror_log": mirror.display().to_string(),
                    "malformed_rows": records.malformed,
                    "audit": audit,
                })));
            }
            println!("mirror_log: {}", mirror.display());
            println!("malformed_rows: {}", records.malformed.len());
            println!("checked: {}", audit.checked);
            println!("not_yet_run: {}", audit.not_yet_run);
            println!("extra: {}", audit.extra);
            for m in &audit.mismatches {
                println!(
                    "  trial {}: expected {}, logged {}",
                    m.global_trial, m.expected, m.logged
                );
            }
            if !audit.is_clean() {
                bail!("mirror log does not follow the protocol");
            }
        }
    }
    Ok(None)
}

struct SimulationOutcome {
    plan: runner::BlockPlan,
    summary: runner::ScriptSummary,
    recording: Option<PathBuf>,
}

fn simulate_block(
    session: &SessionArgs,
    config: &ExperimentConfig,
    hardware: bool,
    drop_every: usize,
    fail_every: usize,
) -> Result<SimulationOutcome> {
    let tracker = runner::SessionTracker::new(&session.results, &session.subject);
    let plan = tracker.prepare_next_block(config, &runner::GenerationStamp::now())?;
    let block = plan.protocol.block(plan.block_index())?;
    let script = runner::expand_block(
        block,
        &plan.protocol.code_book()?,
        plan.protocol.parameters.beeps_per_trial,
    )?;
    let log = runner::MirrorLog::open(&plan.mirror_log)?;
    let settle = Duration::from_millis(config.transport.settle_ms);
    let mut guard = runner::BlockGuard::start(&plan.storage)?;

    if hardware {
        let mut dispatcher = runner::Dispatcher::new(runner::open_port(&config.transport), log, settle);
        let summary = runner::run_block_script(&mut dispatcher, &script)?;
        guard.complete(summary.sent)?;
        dispatcher.close()?;
        return Ok(SimulationOutcome {
            plan,
            summary,
            recording: None,
        });
    }

    // The loopback stands in for the recorder: a byte it keeps is an onset
    // at the dispatch timestamp.
    let port = runner::LoopbackPort::new()
        .with_drop_every(drop_every)
        .with_fail_every(fail_every);
    let capture = port.capture();
    let mut dispatcher = runner::Dispatcher::new(Some(Box::new(port)), log, settle);
    let mut summary = runner::ScriptSummary {
        sent: 0,
        delivered: 0,
        failed: 0,
    };
    let mut onsets = Vec::new();
    for trigger in &script {
        let before = capture.bytes().len();
        let outcome = dispatcher.send(trigger.code, &trigger.label)?;
        summary.sent += 1;
        if outcome.success {
            summary.delivered += 1;
        } else {
            summary.failed += 1;
        }
        if capture.bytes().len() > before {
            onsets.push(analysis::RecordedSample {
                code: trigger.code,
                time: outcome.timestamp,
                sample_index: None,
            });
        }
    }
    guard.complete(summary.sent)?;
    dispatcher.close()?;

    let recording = plan.subject_dir.join(format!(
        "sub-{}_{}_recording.jsonl",
        plan.protocol.subject_id, plan.protocol.generation_timestamp
    ));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&recording)?;
    for onset in &onsets {
        writeln!(file, "{}", serde_json::to_string(onset)?)?;
    }
    file.sync_data()?;
    tracing::info!(
        block = plan.block_index(),
        sent = summary.sent,
        recorded = onsets.len(),
        "simulated block"
    );
    Ok(SimulationOutcome {
        plan,
        summary,
        recording: Some(recording),
    })
}

fn experiment_config(path: Option<&Path>) -> Result<ExperimentConfig> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => ExperimentConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn session_state(session: &SessionArgs) -> Result<runner::SessionState> {
    runner::SessionTracker::new(&session.results, &session.subject)
        .state()?
        .ok_or_else(|| {
            anyhow!(
                "no session for subject `{}` under {}",
                session.subject,
                session.results.display()
            )
        })
}

fn stored_protocol(state: &runner::SessionState) -> Result<&runner::Protocol> {
    state.protocol.as_ref().ok_or_else(|| {
        anyhow!(
            "no protocol in {}; run init-block first",
            state.subject_dir.display()
        )
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Codes { json, .. }
        | Commands::InitBlock { json, .. }
        | Commands::Status { json, .. }
        | Commands::Protocol { json, .. }
        | Commands::GroundTruth { json, .. }
        | Commands::Simulate { json, .. }
        | Commands::Validate { json, .. }
        | Commands::Audit { json, .. } => *json,
    }
}

fn plan_to_json(plan: &runner::BlockPlan) -> Value {
    json!({
        "subject_dir": plan.subject_dir.display().to_string(),
        "block_index": plan.block_index(),
        "block_dir": plan.storage.dir.display().to_string(),
        "generated_protocol": plan.generated_protocol,
        "mirror_log": plan.mirror_log.display().to_string(),
        "trials": plan.trials().len(),
    })
}

fn print_plan(plan: &runner::BlockPlan) {
    println!("subject_dir: {}", plan.subject_dir.display());
    println!("block_index: {}", plan.block_index());
    println!("block_dir: {}", plan.storage.dir.display());
    println!("generated_protocol: {}", plan.generated_protocol);
    println!("mirror_log: {}", plan.mirror_log.display());
    println!("trials: {}", plan.trials().len());
}

fn print_report(report: &analysis::ValidationReport) {
    let s = &report.summary;
    println!("expected: {}", s.total_expected);
    println!("observed: {}", s.total_observed);
    println!("matched: {}", s.matched);
    println!("dropped: {}", s.dropped);
    println!("spurious: {}", s.spurious);
    println!("drop_rate: {:.4}", s.drop_rate);
    println!("quality_warning: {}", report.quality_warning);
    if let Some(t) = &s.timing {
        println!(
            "timing: mean {:.4}s sd {:.4}s range [{:.4}, {:.4}] over {}",
            t.mean, t.std_dev, t.min, t.max, t.count
        );
    }
    for (code, count) in &s.per_code_drops {
        println!("  code {} dropped {}x", code, count);
    }
}
