use std::{
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::Instant,
};

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge for in-flight work.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Accumulated latency: total elapsed micros and the number of samples.
#[derive(Debug, Default)]
pub struct LatencyRecorder {
    samples: AtomicU64,
    total_micros: AtomicU64,
}

impl LatencyRecorder {
    pub fn record_micros(&self, micros: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn total_micros(&self) -> u64 {
        self.total_micros.load(Ordering::Relaxed)
    }
}

/// Records elapsed time into a `LatencyRecorder` when dropped.
#[must_use = "timers record nothing unless held for the measured scope"]
pub struct Timer<'a> {
    start: Instant,
    recorder: &'a LatencyRecorder,
}

impl<'a> Timer<'a> {
    pub fn start(recorder: &'a LatencyRecorder) -> Self {
        Self {
            start: Instant::now(),
            recorder,
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.recorder
            .record_micros(self.start.elapsed().as_micros() as u64);
    }
}

/// Decrements a gauge when dropped; increments it on construction.
pub struct GaugeGuard<'a> {
    gauge: &'a Gauge,
}

impl<'a> GaugeGuard<'a> {
    pub fn new(gauge: &'a Gauge) -> Self {
        gauge.add(1);
        Self { gauge }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.add(-1);
    }
}

pub mod state_metrics {
    use super::{Counter, LatencyRecorder};

    /// Counters surfaced by the state store write path.
    #[derive(Debug, Default)]
    pub struct StateStoreMetrics {
        pub state_writes: Counter,
        pub write_errors: Counter,
        pub write_latency: LatencyRecorder,
    }

    impl StateStoreMetrics {
        pub fn new() -> Self {
            Self::default()
        }
    }
}

pub mod job_metrics {
    use super::{Counter, Gauge};

    /// Counters surfaced by the job dispatcher and reconciler.
    #[derive(Debug, Default)]
    pub struct Metrics {
        pub jobs_dispatched: Counter,
        pub jobs_finished: Counter,
        pub jobs_failed: Counter,
        pub jobs_abandoned: Counter,
        pub jobs_inflight: Gauge,
    }

    impl Metrics {
        pub fn new() -> Self {
            Self::default()
        }
    }
}
