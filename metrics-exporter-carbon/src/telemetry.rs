use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Prefix under which telemetry is recorded into the registry, when enabled.
pub(crate) const TELEMETRY_PREFIX: &str = "carbonstat.client";

/// Exporter telemetry.
///
/// `Telemetry` keeps running totals describing the exporter's own behavior: how many flushes were attempted, how many
/// payloads and bytes were sent or failed, and how many metrics were flushed or put back into the registry after a
/// failed send.
#[derive(Default)]
pub(crate) struct Telemetry {
    flushes: AtomicU64,
    flushes_skipped: AtomicU64,
    endpoints_unavailable: AtomicU64,
    payloads_sent: AtomicU64,
    payloads_failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_failed: AtomicU64,
    metrics_flushed: AtomicU64,
    metrics_requeued: AtomicU64,
}

impl Telemetry {
    /// Applies the given telemetry update to the running totals.
    pub fn apply_update(&self, update: &TelemetryUpdate) {
        self.flushes.fetch_add(update.flushes, Relaxed);
        self.flushes_skipped.fetch_add(update.flushes_skipped, Relaxed);
        self.endpoints_unavailable.fetch_add(update.endpoints_unavailable, Relaxed);
        self.payloads_sent.fetch_add(update.payloads_sent, Relaxed);
        self.payloads_failed.fetch_add(update.payloads_failed, Relaxed);
        self.bytes_sent.fetch_add(update.bytes_sent, Relaxed);
        self.bytes_failed.fetch_add(update.bytes_failed, Relaxed);
        self.metrics_flushed.fetch_add(update.metrics_flushed, Relaxed);
        self.metrics_requeued.fetch_add(update.metrics_requeued, Relaxed);
    }

    /// Returns a point-in-time copy of the running totals.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            flushes: self.flushes.load(Relaxed),
            flushes_skipped: self.flushes_skipped.load(Relaxed),
            endpoints_unavailable: self.endpoints_unavailable.load(Relaxed),
            payloads_sent: self.payloads_sent.load(Relaxed),
            payloads_failed: self.payloads_failed.load(Relaxed),
            bytes_sent: self.bytes_sent.load(Relaxed),
            bytes_failed: self.bytes_failed.load(Relaxed),
            metrics_flushed: self.metrics_flushed.load(Relaxed),
            metrics_requeued: self.metrics_requeued.load(Relaxed),
        }
    }
}

/// Point-in-time totals of the exporter's own telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Flushes that reached the transport.
    pub flushes: u64,

    /// Flushes skipped because another flush was already in flight.
    pub flushes_skipped: u64,

    /// Flushes abandoned because no endpoint could be opened.
    pub endpoints_unavailable: u64,

    /// Payloads sent successfully.
    pub payloads_sent: u64,

    /// Payloads whose send failed.
    pub payloads_failed: u64,

    /// Bytes sent successfully.
    pub bytes_sent: u64,

    /// Bytes whose send failed.
    pub bytes_failed: u64,

    /// Metrics included in successfully sent payloads.
    pub metrics_flushed: u64,

    /// Metrics put back into the registry after a failed send.
    pub metrics_requeued: u64,
}

/// A buffer for collecting the telemetry of a single flush.
#[derive(Default)]
pub(crate) struct TelemetryUpdate {
    flushes: u64,
    flushes_skipped: u64,
    endpoints_unavailable: u64,
    payloads_sent: u64,
    payloads_failed: u64,
    bytes_sent: u64,
    bytes_failed: u64,
    metrics_flushed: u64,
    metrics_requeued: u64,
}

impl TelemetryUpdate {
    /// Tracks a flush skipped because another was in flight.
    pub fn track_flush_skipped(&mut self) {
        self.flushes_skipped += 1;
    }

    /// Tracks a flush abandoned because the endpoint could not be opened.
    pub fn track_endpoint_unavailable(&mut self) {
        self.endpoints_unavailable += 1;
    }

    /// Tracks a successful payload send.
    pub fn track_payload_sent(&mut self, bytes_len: usize, metrics: usize) {
        self.flushes += 1;
        self.payloads_sent += 1;
        self.bytes_sent += bytes_len as u64;
        self.metrics_flushed += metrics as u64;
    }

    /// Tracks a failed payload send.
    pub fn track_payload_failed(&mut self, bytes_len: usize, metrics_requeued: usize) {
        self.flushes += 1;
        self.payloads_failed += 1;
        self.bytes_failed += bytes_len as u64;
        self.metrics_requeued += metrics_requeued as u64;
    }

    /// Returns the non-zero counters of this update, keyed by their metric name suffix.
    pub fn counters(&self) -> impl Iterator<Item = (&'static str, u64)> {
        [
            ("flushes", self.flushes),
            ("flushes_skipped", self.flushes_skipped),
            ("endpoints_unavailable", self.endpoints_unavailable),
            ("payloads_sent", self.payloads_sent),
            ("payloads_failed", self.payloads_failed),
            ("bytes_sent", self.bytes_sent),
            ("bytes_failed", self.bytes_failed),
            ("metrics_flushed", self.metrics_flushed),
            ("metrics_requeued", self.metrics_requeued),
        ]
        .into_iter()
        .filter(|(_, value)| *value > 0)
    }
}
