//! Hardware trigger output plus the mirror log of intent.
//!
//! Every `send` appends exactly one row to the mirror log, whether or not a
//! port is attached and whether or not the write succeeds.

use crate::ground_truth::ExpectedTrigger;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use trigsync_core::{ensure_dir, TransportConfig};

pub const MIRROR_LOG_HEADER: &str =
    "timestamp_logical,timestamp_absolute,trigger_code,event_name,sent_to_eeg";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open trigger port {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("write of code {code} failed: {reason}")]
    Write { code: u8, reason: String },
    #[error("flush failed: {0}")]
    Flush(String),
    #[error("trigger port is closed")]
    Closed,
}

/// The four operations a hardware trigger interface exposes. Implementations
/// release the device in `Drop` as well as in `close`.
pub trait TriggerPort {
    fn write_byte(&mut self, code: u8) -> Result<(), TransportError>;
    fn flush(&mut self) -> Result<(), TransportError>;
    fn close(&mut self) -> Result<(), TransportError>;
    fn describe(&self) -> String;
}

/// A character device (serial adapter, parallel port shim) opened for writing.
pub struct SerialDevicePort {
    path: PathBuf,
    file: Option<File>,
}

impl SerialDevicePort {
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| TransportError::Open {
                device: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }
}

impl TriggerPort for SerialDevicePort {
    fn write_byte(&mut self, code: u8) -> Result<(), TransportError> {
        let file = self.file.as_mut().ok_or(TransportError::Closed)?;
        file.write_all(&[code]).map_err(|e| TransportError::Write {
            code,
            reason: e.to_string(),
        })
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        let file = self.file.as_mut().ok_or(TransportError::Closed)?;
        file.flush().map_err(|e| TransportError::Flush(e.to_string()))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .map_err(|e| TransportError::Flush(e.to_string()))?;
            tracing::info!(device = %self.path.display(), "closed trigger port");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for SerialDevicePort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Shared view of the bytes a `LoopbackPort` actually delivered.
#[derive(Debug, Clone, Default)]
pub struct LoopbackCapture(Arc<Mutex<Vec<u8>>>);

impl LoopbackCapture {
    pub fn bytes(&self) -> Vec<u8> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// In-memory port. `drop_every` loses every n-th byte silently, the way a
/// recorder misses a trigger; `fail_every` makes every n-th write error out.
#[derive(Debug, Default)]
pub struct LoopbackPort {
    capture: LoopbackCapture,
    writes: usize,
    drop_every: Option<usize>,
    fail_every: Option<usize>,
    closed: bool,
}

impl LoopbackPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drop_every(mut self, n: usize) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }

    pub fn with_fail_every(mut self, n: usize) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn capture(&self) -> LoopbackCapture {
        self.capture.clone()
    }
}

impl TriggerPort for LoopbackPort {
    fn write_byte(&mut self, code: u8) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writes += 1;
        if self.fail_every.is_some_and(|n| self.writes % n == 0) {
            return Err(TransportError::Write {
                code,
                reason: "simulated transport failure".to_string(),
            });
        }
        if self.drop_every.is_some_and(|n| self.writes % n == 0) {
            return Ok(());
        }
        self.capture
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(code);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

/// Opens the configured device. A missing or unopenable device is not fatal:
/// the dispatcher then runs portless and logs `sent_to_eeg = no`.
pub fn open_port(config: &TransportConfig) -> Option<Box<dyn TriggerPort>> {
    let device = config.device.as_ref()?;
    match SerialDevicePort::open(device) {
        Ok(port) => {
            tracing::info!(device = %device.display(), "opened trigger port");
            Some(Box::new(port))
        }
        Err(err) => {
            tracing::warn!(error = %err, "continuing without trigger hardware");
            None
        }
    }
}

/// Source of the logical timestamp recorded with each trigger, in seconds.
pub trait Clock {
    fn now(&self) -> f64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Advances by a fixed step on every reading. Used for simulation.
pub struct SteppedClock {
    next: Cell<f64>,
    step: f64,
}

impl SteppedClock {
    pub fn new(start: f64, step: f64) -> Self {
        Self {
            next: Cell::new(start),
            step,
        }
    }
}

impl Clock for SteppedClock {
    fn now(&self) -> f64 {
        let t = self.next.get();
        self.next.set(t + self.step);
        t
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub code: u8,
    pub label: String,
    pub logical_time: f64,
    pub absolute_time: String,
    pub dispatch_success: bool,
}

impl TriggerEvent {
    fn to_csv_row(&self) -> String {
        format!(
            "{:.6},{},{},{},{}",
            self.logical_time,
            self.absolute_time,
            self.code,
            csv_field(&self.label),
            if self.dispatch_success { "yes" } else { "no" }
        )
    }
}

/// One physical line per row: control characters become spaces.
fn csv_field(raw: &str) -> String {
    let flat: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if flat.contains([',', '"']) {
        format!("\"{}\"", flat.replace('"', "\"\""))
    } else {
        flat
    }
}

fn split_csv_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Append-only CSV of every attempted trigger. Each row reaches the disk
/// before `append` returns.
pub struct MirrorLog {
    path: PathBuf,
    file: File,
    rows: usize,
}

impl MirrorLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            writeln!(file, "{}", MIRROR_LOG_HEADER)?;
            file.sync_data()?;
        } else {
            // A crash mid-row leaves no newline; close the torn row so the
            // next append starts on its own line.
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                tracing::warn!(path = %path.display(), "mirror log ends mid-row; terminating it");
                writeln!(file)?;
                file.sync_data()?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            rows: 0,
        })
    }

    pub fn append(&mut self, event: &TriggerEvent) -> io::Result<()> {
        writeln!(self.file, "{}", event.to_csv_row())?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.rows += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this handle.
    pub fn rows_written(&self) -> usize {
        self.rows
    }
}

/// Rows recovered from a mirror log. `malformed` holds the 1-based line
/// numbers of rows that could not be parsed, such as a row torn by a crash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorRecords {
    pub events: Vec<TriggerEvent>,
    pub malformed: Vec<usize>,
}

fn parse_mirror_row(line: &str) -> Result<TriggerEvent, &'static str> {
    let fields = split_csv_row(line);
    if fields.len() != 5 {
        return Err("expected 5 columns");
    }
    Ok(TriggerEvent {
        logical_time: fields[0].parse().map_err(|_| "bad timestamp_logical")?,
        absolute_time: fields[1].clone(),
        code: fields[2].parse().map_err(|_| "bad trigger_code")?,
        label: fields[3].clone(),
        dispatch_success: match fields[4].as_str() {
            "yes" => true,
            "no" => false,
            _ => return Err("sent_to_eeg must be yes or no"),
        },
    })
}

/// Reads every parseable row. Malformed rows are skipped and reported
/// rather than failing the whole log.
pub fn read_mirror_log(path: &Path) -> io::Result<MirrorRecords> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let mut records = MirrorRecords::default();
    for (line_no, line) in text.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() || line == MIRROR_LOG_HEADER {
            continue;
        }
        match parse_mirror_row(line) {
            Ok(event) => records.events.push(event),
            Err(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    reason,
                    "skipping malformed mirror log row"
                );
                records.malformed.push(line_no + 1);
            }
        }
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchOutcome {
    pub timestamp: f64,
    pub success: bool,
}

/// Owns the trigger port and the mirror log for one session.
pub struct Dispatcher {
    port: Option<Box<dyn TriggerPort>>,
    log: MirrorLog,
    clock: Box<dyn Clock>,
    settle: Duration,
}

impl Dispatcher {
    pub fn new(port: Option<Box<dyn TriggerPort>>, log: MirrorLog, settle: Duration) -> Self {
        Self::with_clock(port, log, settle, Box::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        port: Option<Box<dyn TriggerPort>>,
        log: MirrorLog,
        settle: Duration,
        clock: Box<dyn Clock>,
    ) -> Self {
        match &port {
            Some(port) => tracing::info!(port = %port.describe(), "dispatcher ready"),
            None => tracing::info!("dispatcher ready without trigger port"),
        }
        Self {
            port,
            log,
            clock,
            settle,
        }
    }

    pub fn has_port(&self) -> bool {
        self.port.is_some()
    }

    pub fn mirror_log(&self) -> &MirrorLog {
        &self.log
    }

    /// Writes one code and records the attempt. Transport failures only turn
    /// `success` false; the returned error is a mirror-log I/O failure.
    pub fn send(&mut self, code: u8, label: &str) -> io::Result<DispatchOutcome> {
        let timestamp = self.clock.now();
        let absolute_time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let success = match self.port.as_mut() {
            Some(port) => match port.write_byte(code).and_then(|_| port.flush()) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(code, label, error = %err, "trigger not delivered");
                    false
                }
            },
            None => false,
        };
        if success && !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        let event = TriggerEvent {
            code,
            label: label.to_string(),
            logical_time: timestamp,
            absolute_time,
            dispatch_success: success,
        };
        self.log.append(&event)?;
        tracing::debug!(code, label, timestamp, success, "trigger");
        Ok(DispatchOutcome { timestamp, success })
    }

    pub fn close(mut self) -> Result<(), TransportError> {
        match self.port.take() {
            Some(mut port) => port.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.close();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSummary {
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Sends an expected trigger script in order, as the trial loop would.
pub fn run_block_script(
    dispatcher: &mut Dispatcher,
    script: &[ExpectedTrigger],
) -> io::Result<ScriptSummary> {
    let mut summary = ScriptSummary {
        sent: 0,
        delivered: 0,
        failed: 0,
    };
    for trigger in script {
        let outcome = dispatcher.send(trigger.code, &trigger.label)?;
        summary.sent += 1;
        if outcome.success {
            summary.delivered += 1;
        } else {
            summary.failed += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "trigsync_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    fn dispatcher(root: &Path, port: Option<Box<dyn TriggerPort>>) -> Dispatcher {
        let log = MirrorLog::open(&root.join("triggers.csv")).unwrap();
        Dispatcher::with_clock(
            port,
            log,
            Duration::ZERO,
            Box::new(SteppedClock::new(0.0, 0.25)),
        )
    }

    #[test]
    fn every_send_is_logged_in_order_despite_failures() {
        let root = temp_root("mirror_order");
        let port = LoopbackPort::new().with_fail_every(3);
        let capture = port.capture();
        let mut d = dispatcher(&root, Some(Box::new(port)));
        let codes: Vec<u8> = (1..=10).collect();
        let mut outcomes = Vec::new();
        for code in &codes {
            outcomes.push(d.send(*code, &format!("event_{}", code)).unwrap());
        }
        drop(d);

        let events = read_mirror_log(&root.join("triggers.csv")).unwrap().events;
        assert_eq!(events.len(), codes.len());
        assert_eq!(events.iter().map(|e| e.code).collect::<Vec<_>>(), codes);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.dispatch_success, (i + 1) % 3 != 0);
            assert_eq!(event.dispatch_success, outcomes[i].success);
            assert_eq!(event.logical_time, i as f64 * 0.25);
        }
        assert_eq!(capture.bytes(), vec![1, 2, 4, 5, 7, 8, 10]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn portless_dispatch_still_logs() {
        let root = temp_root("portless");
        let mut d = dispatcher(&root, None);
        assert!(!d.has_port());
        let outcome = d.send(42, "fixation").unwrap();
        assert!(!outcome.success);
        assert_eq!(d.mirror_log().rows_written(), 1);
        drop(d);
        let events = read_mirror_log(&root.join("triggers.csv")).unwrap().events;
        assert_eq!(events.len(), 1);
        assert!(!events[0].dispatch_success);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn reopened_log_appends_without_second_header() {
        let root = temp_root("reopen");
        for code in [5u8, 6] {
            let mut d = dispatcher(&root, Some(Box::new(LoopbackPort::new())));
            d.send(code, "label, with \"quotes\"").unwrap();
        }
        let raw = std::fs::read_to_string(root.join("triggers.csv")).unwrap();
        assert_eq!(raw.matches(MIRROR_LOG_HEADER).count(), 1);
        let events = read_mirror_log(&root.join("triggers.csv")).unwrap().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].label, "label, with \"quotes\"");
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn torn_final_row_is_skipped_and_later_rows_survive() {
        let root = temp_root("torn_row");
        let path = root.join("triggers.csv");
        {
            let mut d = dispatcher(&root, Some(Box::new(LoopbackPort::new())));
            for code in [1u8, 2, 3] {
                d.send(code, "event").unwrap();
            }
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "3.000000,2026").unwrap();
        }
        {
            let mut d = dispatcher(&root, Some(Box::new(LoopbackPort::new())));
            d.send(4, "event").unwrap();
        }
        let records = read_mirror_log(&path).unwrap();
        assert_eq!(
            records.events.iter().map(|e| e.code).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(records.malformed, vec![5]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn newline_in_label_stays_on_one_row() {
        let root = temp_root("newline_label");
        let mut d = dispatcher(&root, None);
        d.send(10, "concept_ice\ncream_category_A").unwrap();
        d.send(40, "mask").unwrap();
        drop(d);
        let records = read_mirror_log(&root.join("triggers.csv")).unwrap();
        assert!(records.malformed.is_empty());
        assert_eq!(records.events.len(), 2);
        assert_eq!(records.events[0].label, "concept_ice cream_category_A");
        assert_eq!(records.events[1].label, "mask");
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn absolute_time_is_taken_before_settle() {
        let root = temp_root("absolute_time");
        let log = MirrorLog::open(&root.join("triggers.csv")).unwrap();
        let mut d = Dispatcher::with_clock(
            Some(Box::new(LoopbackPort::new())),
            log,
            Duration::from_millis(300),
            Box::new(SteppedClock::new(0.0, 0.25)),
        );
        let before = Utc::now();
        d.send(7, "fixation").unwrap();
        drop(d);
        let events = read_mirror_log(&root.join("triggers.csv")).unwrap().events;
        let stamped = chrono::DateTime::parse_from_rfc3339(&events[0].absolute_time).unwrap();
        let lag = stamped.with_timezone(&Utc) - before;
        assert!(lag < chrono::Duration::milliseconds(150), "lag {:?}", lag);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn loopback_drops_silently() {
        let mut port = LoopbackPort::new().with_drop_every(2);
        for code in 1..=6u8 {
            port.write_byte(code).unwrap();
        }
        assert_eq!(port.capture().bytes(), vec![1, 3, 5]);
        port.close().unwrap();
        assert!(matches!(port.write_byte(7), Err(TransportError::Closed)));
    }

    #[test]
    fn missing_device_falls_back_to_portless() {
        let config = TransportConfig {
            device: Some(PathBuf::from("/nonexistent/trigsync/ttyUSB9")),
            settle_ms: 5,
        };
        assert!(open_port(&config).is_none());
        assert!(open_port(&TransportConfig::default()).is_none());
    }
}
