//! Timing collection for the prediction stages.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::debug;

#[derive(Debug, Default)]
struct TelemetryState {
    stages: Vec<(&'static str, Duration)>,
}

/// Snapshot of telemetry suitable for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub stages: Vec<(String, Duration)>,
}

impl TelemetrySnapshot {
    /// Returns the first recorded duration for `stage`.
    pub fn stage(&self, stage: &str) -> Option<Duration> {
        self.stages
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, elapsed)| *elapsed)
    }
}

/// Shared sink capturing per-stage durations.
#[derive(Clone, Default)]
pub struct TelemetrySink {
    state: Arc<Mutex<TelemetryState>>,
}

impl TelemetrySink {
    fn lock(&self) -> MutexGuard<'_, TelemetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records how long a stage took.
    pub fn record_stage(&self, stage: &'static str, elapsed: Duration) {
        debug!(stage, elapsed_ms = elapsed.as_millis() as u64, "stage finished");
        self.lock().stages.push((stage, elapsed));
    }

    /// Runs `work` and records its duration under `stage`, whatever it returns.
    pub fn time<T>(&self, stage: &'static str, work: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let output = work();
        self.record_stage(stage, started.elapsed());
        output
    }

    /// Exposes a snapshot for diagnostics and testing.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            stages: self
                .lock()
                .stages
                .iter()
                .map(|(name, elapsed)| (name.to_string(), *elapsed))
                .collect(),
        }
    }
}
