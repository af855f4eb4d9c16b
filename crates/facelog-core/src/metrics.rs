//! Reconciliation metrics.
//!
//! Everything is emitted through the `metrics` facade. There is no exporter:
//! the daemon installs a [`MetricsRecorder`] and logs a [`MetricsSnapshot`]
//! periodically.

use metrics::{
    counter, describe_counter, describe_histogram, histogram, Counter, Gauge, Histogram, Key,
    KeyName, Metadata, Recorder, SetRecorderError, SharedString, Unit,
};
use metrics_util::registry::{AtomicStorage, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Top-K queries issued (events that got past dedup and the camera lock).
pub const MATCH_ATTEMPTS: &str = "facelog_match_attempts_total";

/// Match transactions written by the sink.
pub const MATCH_SUCCESSES: &str = "facelog_match_successes_total";

/// Unknown ("guess") transactions written by the sink.
pub const GUESSES_CREATED: &str = "facelog_guesses_created_total";

/// Sink calls, labelled `result` = `ok` | `error`.
pub const SINK_CALLS: &str = "facelog_sink_calls_total";

/// Events that ended without a transaction, labelled by `reason`.
pub const EVENTS_SUPPRESSED: &str = "facelog_events_suppressed_total";

/// Events dropped before a decision, labelled by `reason`.
pub const EVENTS_DROPPED: &str = "facelog_events_dropped_total";

/// Time spent in the similarity query and scoring.
pub const MATCH_DURATION: &str = "facelog_match_duration_seconds";

/// Registers all metric descriptions.
///
/// Call once at startup after installing the recorder.
pub fn register_metrics() {
    describe_counter!(MATCH_ATTEMPTS, "Similarity queries issued");
    describe_counter!(MATCH_SUCCESSES, "Match transactions recorded");
    describe_counter!(GUESSES_CREATED, "Unknown transactions recorded");
    describe_counter!(SINK_CALLS, "Transaction sink calls by result");
    describe_counter!(EVENTS_SUPPRESSED, "Events ended without a transaction, by reason");
    describe_counter!(EVENTS_DROPPED, "Events dropped before a decision, by reason");
    describe_histogram!(MATCH_DURATION, Unit::Seconds, "Similarity query and scoring time");
}

pub fn record_match_attempt() {
    counter!(MATCH_ATTEMPTS).increment(1);
}

pub fn record_match_success() {
    counter!(MATCH_SUCCESSES).increment(1);
}

pub fn record_guess_created() {
    counter!(GUESSES_CREATED).increment(1);
}

pub fn record_sink_call(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!(SINK_CALLS, "result" => result).increment(1);
}

pub fn record_suppressed(reason: &'static str) {
    counter!(EVENTS_SUPPRESSED, "reason" => reason).increment(1);
}

pub fn record_dropped(reason: &'static str) {
    counter!(EVENTS_DROPPED, "reason" => reason).increment(1);
}

pub fn record_match_duration(elapsed: Duration) {
    histogram!(MATCH_DURATION).record(elapsed.as_secs_f64());
}

/// Counter totals since start, plus match-duration statistics over the
/// samples recorded since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub match_attempts: u64,
    pub match_successes: u64,
    pub guesses_created: u64,
    pub sink_successes: u64,
    pub sink_failures: u64,
    pub suppressed: BTreeMap<String, u64>,
    pub dropped: BTreeMap<String, u64>,
    pub match_duration_samples: u64,
    pub match_duration_mean_ms: f64,
    pub match_duration_max_ms: f64,
}

impl MetricsSnapshot {
    pub fn suppressed_for(&self, reason: &str) -> u64 {
        self.suppressed.get(reason).copied().unwrap_or(0)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.values().sum()
    }
}

/// In-process recorder backed by an atomic registry.
///
/// Cheap to clone; clones share the same registry, so one clone can be
/// installed globally while another takes snapshots.
#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::atomic()),
        }
    }

    /// Install a clone as the process-wide recorder.
    pub fn install(&self) -> Result<(), SetRecorderError<Self>> {
        metrics::set_global_recorder(self.clone())
    }

    /// Read every counter and drain the match-duration histogram.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();

        self.registry.visit_counters(|key, counter| {
            let value = counter.load(Ordering::Relaxed);
            let label = |name: &str| {
                key.labels()
                    .find(|l| l.key() == name)
                    .map(|l| l.value().to_string())
                    .unwrap_or_default()
            };
            match key.name() {
                MATCH_ATTEMPTS => snap.match_attempts += value,
                MATCH_SUCCESSES => snap.match_successes += value,
                GUESSES_CREATED => snap.guesses_created += value,
                SINK_CALLS if label("result") == "ok" => snap.sink_successes += value,
                SINK_CALLS => snap.sink_failures += value,
                EVENTS_SUPPRESSED => *snap.suppressed.entry(label("reason")).or_default() += value,
                EVENTS_DROPPED => *snap.dropped.entry(label("reason")).or_default() += value,
                _ => {}
            }
        });

        let mut total = 0.0f64;
        let mut max = 0.0f64;
        let mut samples = 0u64;
        self.registry.visit_histograms(|key, bucket| {
            if key.name() != MATCH_DURATION {
                return;
            }
            bucket.clear_with(|values| {
                for &secs in values {
                    total += secs;
                    max = max.max(secs);
                    samples += 1;
                }
            });
        });
        snap.match_duration_samples = samples;
        if samples > 0 {
            snap.match_duration_mean_ms = total / samples as f64 * 1000.0;
            snap.match_duration_max_ms = max * 1000.0;
        }

        snap
    }
}

impl Recorder for MetricsRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| Counter::from_arc(c.clone()))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |g| Gauge::from_arc(g.clone()))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h| Histogram::from_arc(h.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_grouped_by_label() {
        let recorder = MetricsRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            record_match_attempt();
            record_match_attempt();
            record_sink_call(true);
            record_sink_call(false);
            record_guess_created();
            record_suppressed("camera_busy");
            record_suppressed("camera_busy");
            record_suppressed("duplicate_frame");
            record_dropped("no_face_detected");
        });

        let snap = recorder.snapshot();
        assert_eq!(snap.match_attempts, 2);
        assert_eq!(snap.sink_successes, 1);
        assert_eq!(snap.sink_failures, 1);
        assert_eq!(snap.guesses_created, 1);
        assert_eq!(snap.match_successes, 0);
        assert_eq!(snap.suppressed_for("camera_busy"), 2);
        assert_eq!(snap.suppressed_for("duplicate_frame"), 1);
        assert_eq!(snap.suppressed_for("guess_cooldown"), 0);
        assert_eq!(snap.dropped_total(), 1);
    }

    #[test]
    fn test_duration_drained_per_snapshot() {
        let recorder = MetricsRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            record_match_attempt();
            record_match_duration(Duration::from_millis(4));
            record_match_duration(Duration::from_millis(8));
        });

        let first = recorder.snapshot();
        assert_eq!(first.match_duration_samples, 2);
        assert!((first.match_duration_mean_ms - 6.0).abs() < 1e-6);
        assert!((first.match_duration_max_ms - 8.0).abs() < 1e-6);

        // counters are cumulative, durations are per interval
        let second = recorder.snapshot();
        assert_eq!(second.match_attempts, 1);
        assert_eq!(second.match_duration_samples, 0);
        assert_eq!(second.match_duration_mean_ms, 0.0);
    }

    #[test]
    fn test_recorders_are_isolated() {
        let busy = MetricsRecorder::new();
        let idle = MetricsRecorder::new();
        metrics::with_local_recorder(&busy, record_match_attempt);

        assert_eq!(busy.snapshot().match_attempts, 1);
        assert_eq!(idle.snapshot(), MetricsSnapshot::default());
    }
}
