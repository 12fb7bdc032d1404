//! Environment-variable configuration glue.
//!
//! All pipeline tuning comes from the environment with sensible defaults.
//! A variable that is set but unparsable is a fatal start-up error, not
//! something to silently paper over with a default.

use std::env;
use std::time::Duration;

use crate::error::SpanError;

/// Number of parallel batch writers.
pub const SPAN_RUNNERS: &str = "SPAN_RUNNERS";
/// Depth of the finished-span queue.
pub const SPAN_QUEUE_CAPACITY: &str = "SPAN_QUEUE_CAPACITY";
/// Maximum spans per `batchWrite` call.
pub const SPAN_BATCH_SIZE: &str = "SPAN_BATCH_SIZE";
/// Nominal flush interval for a non-empty batch (e.g. `5s`).
pub const SPAN_BATCH_DUR: &str = "SPAN_BATCH_DUR";
/// Per-call deadline for `batchWrite` (e.g. `10s`).
pub const SPAN_CREATE_TIMEOUT: &str = "SPAN_CREATE_TIMEOUT";
/// Prefix for the capacity gauge's queue label.
pub const LAGER_SPAN_PREFIX: &str = "LAGER_SPAN_PREFIX";
/// Ambient project resolution when the registrar is given none.
pub const GOOGLE_CLOUD_PROJECT: &str = "GOOGLE_CLOUD_PROJECT";

/// Logs a start-up misconfiguration and aborts the process.
pub(crate) fn fatal(message: &str) -> ! {
    tracing::error!("{message}");
    std::process::exit(1);
}

/// Reads an integer configuration value from `var`, returning `tacit` when
/// the variable is unset or empty.
///
/// An unparsable value is a fatal start-up error. Passing an empty
/// variable name is a fatal programmer error.
pub fn env_usize(tacit: usize, var: &str) -> usize {
    if var.is_empty() {
        fatal("empty environment variable name passed to env_usize()");
    }
    let val = env::var(var).unwrap_or_default();
    if val.is_empty() {
        return tacit;
    }
    match val.parse::<usize>() {
        Ok(n) => n,
        Err(err) => fatal(&format!("invalid integer value {val:?} in {var}: {err}")),
    }
}

/// Reads a duration configuration value (`"5s"`, `"150ms"`, ...) from
/// `var`, returning `tacit` when the variable is unset or empty.
///
/// An unparsable value is a fatal start-up error. Passing an empty
/// variable name is a fatal programmer error.
pub fn env_duration(tacit: Duration, var: &str) -> Duration {
    if var.is_empty() {
        fatal("empty environment variable name passed to env_duration()");
    }
    let val = env::var(var).unwrap_or_default();
    if val.is_empty() {
        return tacit;
    }
    match humantime::parse_duration(&val) {
        Ok(dur) => dur,
        Err(err) => fatal(&format!("invalid duration value {val:?} in {var}: {err}")),
    }
}

pub(crate) fn ambient_project() -> Result<String, SpanError> {
    match env::var(GOOGLE_CLOUD_PROJECT) {
        Ok(project) if !project.is_empty() => Ok(project),
        _ => Err(SpanError::NoProject),
    }
}

/// Tuning for a [`Registrar`]'s queue and batch writers.
///
/// `PipelineConfig::default()` reads the `SPAN_*` environment variables;
/// the `with_*` methods override individual knobs (mostly useful in
/// tests).
///
/// [`Registrar`]: crate::Registrar
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub(crate) runners: usize,
    pub(crate) queue_capacity: usize,
    pub(crate) max_spans: usize,
    pub(crate) max_batch_dur: Duration,
    pub(crate) max_lag: Duration,
    pub(crate) gauge_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            runners: env_usize(2, SPAN_RUNNERS),
            queue_capacity: env_usize(1000, SPAN_QUEUE_CAPACITY),
            max_spans: env_usize(10_000, SPAN_BATCH_SIZE),
            max_batch_dur: env_duration(Duration::from_secs(5), SPAN_BATCH_DUR),
            max_lag: env_duration(Duration::from_secs(10), SPAN_CREATE_TIMEOUT),
            gauge_prefix: env::var(LAGER_SPAN_PREFIX).unwrap_or_default(),
        }
    }
}

impl PipelineConfig {
    /// Set the number of parallel batch writers.
    pub fn with_runners(mut self, runners: usize) -> Self {
        self.runners = runners.max(1);
        self
    }

    /// Set the depth of the finished-span queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the maximum number of spans per `batchWrite` call.
    pub fn with_max_spans(mut self, max_spans: usize) -> Self {
        self.max_spans = max_spans.max(1);
        self
    }

    /// Set the nominal flush interval; each arm multiplies it by a random
    /// factor in `[1.0, 1.5)`.
    pub fn with_max_batch_dur(mut self, dur: Duration) -> Self {
        self.max_batch_dur = dur;
        self
    }

    /// Set the per-call `batchWrite` deadline.
    pub fn with_max_lag(mut self, lag: Duration) -> Self {
        self.max_lag = lag;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_yield_defaults() {
        assert_eq!(env_usize(7, "CLOUDTRACE_SPANS_TEST_UNSET_INT"), 7);
        assert_eq!(
            env_duration(Duration::from_secs(3), "CLOUDTRACE_SPANS_TEST_UNSET_DUR"),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn set_variables_are_parsed() {
        env::set_var("CLOUDTRACE_SPANS_TEST_INT", "12");
        env::set_var("CLOUDTRACE_SPANS_TEST_DUR", "150ms");
        assert_eq!(env_usize(7, "CLOUDTRACE_SPANS_TEST_INT"), 12);
        assert_eq!(
            env_duration(Duration::from_secs(3), "CLOUDTRACE_SPANS_TEST_DUR"),
            Duration::from_millis(150)
        );
        env::remove_var("CLOUDTRACE_SPANS_TEST_INT");
        env::remove_var("CLOUDTRACE_SPANS_TEST_DUR");
    }
}
