//! Step execution tracing.
//!
//! A [`StepSink`] observes every `mark_step` program execution: `before_step`
//! fires with the step's context (device, structural hash, cache outcome) and
//! `after_step` with duration and status. The process-wide sink defaults to a
//! [`JsonlSink`] writing to the `LAZE_STEP_TRACE` path when that variable is
//! set, and can be replaced at runtime with [`set_sink`].

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::device::Device;
use crate::env;

/// Identity and cache information of one step execution.
#[derive(Debug, Clone, Serialize)]
pub struct StepContext {
    pub trace_id: u64,
    pub executor: usize,
    pub backend: String,
    pub device: Device,
    pub step_hash: u64,
    pub cache: CacheOutcome,
    pub tensors: usize,
    pub timestamp: SystemTime,
}

/// How the step program was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepStatus {
    Success,
    Failure { message: String },
}

/// Outcome of one step execution.
#[derive(Debug, Clone, Serialize)]
pub struct StepStats {
    pub duration: Duration,
    pub output_count: usize,
    pub status: StepStatus,
}

/// Observer for step program executions.
pub trait StepSink: Send + Sync {
    fn before_step(&self, context: &StepContext);
    fn after_step(&self, context: &StepContext, stats: &StepStats);
}

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_trace_id() -> u64 {
    NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed)
}

static SINK: Lazy<RwLock<Option<Arc<dyn StepSink>>>> = Lazy::new(|| RwLock::new(default_sink()));

fn default_sink() -> Option<Arc<dyn StepSink>> {
    let path = env::step_trace_path()?;
    match JsonlSink::to_file(path) {
        Ok(sink) => Some(Arc::new(sink)),
        Err(_) => None,
    }
}

/// Returns the installed sink, if any.
pub fn current_sink() -> Option<Arc<dyn StepSink>> {
    SINK.read().expect("trace sink poisoned").clone()
}

/// Replaces the process-wide sink; `None` disables tracing.
pub fn set_sink(sink: Option<Arc<dyn StepSink>>) {
    *SINK.write().expect("trace sink poisoned") = sink;
}

#[derive(Serialize)]
struct StepRecord<'a> {
    event: &'static str,
    #[serde(flatten)]
    context: &'a StepContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a StepStats>,
}

/// Sink writing one JSON object per line.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonlSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn to_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }

    // Trace output is best effort; write failures never affect execution.
    fn write_record(&self, record: &StepRecord<'_>) {
        if let Ok(line) = serde_json::to_string(record) {
            let mut writer = self.writer.lock().expect("trace writer poisoned");
            let _ = writeln!(writer, "{line}");
        }
    }
}

impl StepSink for JsonlSink {
    fn before_step(&self, context: &StepContext) {
        self.write_record(&StepRecord {
            event: "step_begin",
            context,
            stats: None,
        });
    }

    fn after_step(&self, context: &StepContext, stats: &StepStats) {
        self.write_record(&StepRecord {
            event: "step_end",
            context,
            stats: Some(stats),
        });
    }
}
