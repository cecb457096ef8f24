//! Perf counters and logging setup for the viewer.
//!
//! Counters stay off unless `PFOD_PERF` is set. They cover command round
//! trips to the device, applying a finished session to the visible model, and
//! request queue depth. The engine logs a [`PerfSummary`] when it stops.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, Span};

use crate::sync::Dispatch;

const LOG_EVERY: u64 = 50;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| env_truthy("PFOD_PERF").unwrap_or(false));

static STATS: Lazy<Mutex<PerfStats>> = Lazy::new(|| Mutex::new(PerfStats::default()));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timing {
    /// Command sent until the device answered or the transport gave up.
    RoundTrip,
    /// Merge and swap of a completed session.
    Apply,
}

impl Timing {
    pub fn as_str(self) -> &'static str {
        match self {
            Timing::RoundTrip => "round_trip",
            Timing::Apply => "apply",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimingSummary {
    pub count: u64,
    pub avg: Duration,
    pub max: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfSummary {
    pub round_trip: TimingSummary,
    pub apply: TimingSummary,
    pub queue_depth: u64,
    pub peak_queue_depth: u64,
}

impl PerfSummary {
    pub fn log(&self) {
        info!(
            target: "pfod::perf",
            round_trips = self.round_trip.count,
            avg_round_trip_ms = self.round_trip.avg.as_millis() as u64,
            max_round_trip_ms = self.round_trip.max.as_millis() as u64,
            applies = self.apply.count,
            avg_apply_us = self.apply.avg.as_micros() as u64,
            max_apply_us = self.apply.max.as_micros() as u64,
            peak_queue_depth = self.peak_queue_depth,
            "perf summary"
        );
    }
}

#[derive(Default)]
struct PerfStat {
    total: Duration,
    max: Duration,
    count: u64,
}

impl PerfStat {
    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.max = self.max.max(duration);
    }

    fn summary(&self) -> TimingSummary {
        let avg = u32::try_from(self.count)
            .ok()
            .filter(|count| *count > 0)
            .map(|count| self.total / count)
            .unwrap_or_default();
        TimingSummary {
            count: self.count,
            avg,
            max: self.max,
        }
    }
}

#[derive(Default)]
struct PerfStats {
    round_trip: PerfStat,
    apply: PerfStat,
    queue_depth: u64,
    peak_queue_depth: u64,
}

impl PerfStats {
    fn record_duration(&mut self, timing: Timing, duration: Duration) {
        let stat = match timing {
            Timing::RoundTrip => &mut self.round_trip,
            Timing::Apply => &mut self.apply,
        };
        stat.record(duration);
        if stat.count % LOG_EVERY == 0 {
            let summary = stat.summary();
            debug!(
                target: "pfod::perf",
                metric = timing.as_str(),
                count = summary.count,
                avg_us = summary.avg.as_micros() as u64,
                max_us = summary.max.as_micros() as u64,
                "perf"
            );
        }
    }

    fn record_queue_depth(&mut self, depth: u64) {
        self.queue_depth = depth;
        self.peak_queue_depth = self.peak_queue_depth.max(depth);
    }

    fn summary(&self) -> PerfSummary {
        PerfSummary {
            round_trip: self.round_trip.summary(),
            apply: self.apply.summary(),
            queue_depth: self.queue_depth,
            peak_queue_depth: self.peak_queue_depth,
        }
    }
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn record_duration(timing: Timing, duration: Duration) {
    if enabled() {
        STATS.lock().record_duration(timing, duration);
    }
}

pub fn record_queue_depth(depth: usize) {
    if enabled() {
        STATS.lock().record_queue_depth(depth as u64);
    }
}

/// `None` unless counters are enabled.
pub fn summary() -> Option<PerfSummary> {
    enabled().then(|| STATS.lock().summary())
}

pub struct PerfGuard {
    timing: Timing,
    start: Instant,
}

impl PerfGuard {
    pub fn new(timing: Timing) -> Option<Self> {
        if !enabled() {
            return None;
        }
        Some(Self {
            timing,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        record_duration(self.timing, self.start.elapsed());
    }
}

/// Span covering one command on the wire.
pub fn request_span(dispatch: &Dispatch) -> Span {
    tracing::debug_span!(
        target: "pfod::engine",
        "request",
        id = dispatch.id,
        kind = %dispatch.kind,
        command = %dispatch.command
    )
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber; later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter())?;

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled_deps {
            eprintln!(
                "[pfod-log] suppressing dependency trace noise; set PFOD_TRACE_DEPS=1 or PFOD_LOG_FILTER to override"
            );
        }
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> Result<(EnvFilter, bool), InitError> {
        let (filter, throttled) = match std::env::var("PFOD_LOG_FILTER") {
            Ok(filter) => (filter, false),
            Err(_) => {
                let (filter, throttled) = default_filter_for(level);
                (with_perf(filter, super::enabled()), throttled)
            }
        };
        let filter = EnvFilter::try_new(&filter)
            .map_err(|err| InitError::Configure(format!("bad filter {filter:?}: {err}")))?;
        Ok((filter, throttled))
    }

    const TRACE_DEP_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "mio", "h2"];

    // `pfod` prefixes the crate names and every `pfod::*` event target.
    fn default_filter_for(level: LevelFilter) -> (String, bool) {
        let base = match level {
            LevelFilter::TRACE => "info,pfod=trace",
            LevelFilter::DEBUG => "info,pfod=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        if level == LevelFilter::TRACE && !allow_dependency_traces() {
            (throttle_dependency_traces(base), true)
        } else {
            (base.to_owned(), false)
        }
    }

    /// Perf lines and the shutdown summary show at any level while counters
    /// are on.
    fn with_perf(mut filter: String, perf: bool) -> String {
        if perf && !filter.contains("pfod=trace") {
            filter.push_str(",pfod::perf=debug");
        }
        filter
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy("PFOD_TRACE_DEPS").unwrap_or(false)
    }

    fn throttle_dependency_traces(base: &str) -> String {
        let mut filter = base.to_owned();
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
        filter
    }

}
