use std::{
    collections::{hash_map::Entry, HashMap},
    sync::atomic::{
        AtomicBool, AtomicU32,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    time::SystemTime,
};

use parking_lot::{Mutex, RwLock};
use quanta::Clock;
use tracing::{debug, error, trace, warn};

use crate::{
    forwarder::{Client, RemoteAddr},
    metric::Metric,
    telemetry::{Telemetry, TelemetrySnapshot, TelemetryUpdate, TELEMETRY_PREFIX},
    writer::PayloadWriter,
};

/// Outcome of a single flush.
///
/// Transport problems never surface as errors: a flush that could not deliver its payload leaves every metric it would
/// have sent in the registry, to be included in the next flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The payload was handed to the transport.
    Sent {
        /// Heartbeat counter included in the payload.
        heartbeat: u32,

        /// Number of metrics included in the payload.
        metrics: usize,

        /// Size of the payload, in bytes.
        bytes: usize,
    },

    /// Another flush was already in flight, so nothing was done.
    InFlight,

    /// The transport endpoint could not be opened, so no metrics were taken out of the registry.
    Unavailable,

    /// Sending the payload failed, and its metrics were put back into the registry.
    Failed {
        /// Heartbeat counter included in the payload.
        heartbeat: u32,

        /// Number of metrics put back into the registry.
        ///
        /// Accumulating metrics are not counted: they are carried forward by every flush, whatever its outcome.
        metrics: usize,
    },
}

impl FlushOutcome {
    /// Returns `true` if the payload was sent.
    pub fn is_sent(&self) -> bool {
        matches!(self, FlushOutcome::Sent { .. })
    }
}

/// Exporter state configuration.
pub(crate) struct StateConfiguration {
    /// Destination of flushed payloads.
    pub remote_addr: RemoteAddr,

    /// Namespace applied to every metric path.
    pub namespace: String,

    /// Whether or not to record internal telemetry into the registry.
    pub telemetry: bool,

    /// Clock used by timers.
    pub clock: Clock,
}

/// Marks a flush as in flight for as long as it is held.
struct SendingGuard<'a>(&'a AtomicBool);

impl<'a> SendingGuard<'a> {
    fn acquire(sending: &'a AtomicBool) -> Option<Self> {
        sending.compare_exchange(false, true, AcqRel, Acquire).ok().map(|_| SendingGuard(sending))
    }
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Release);
    }
}

/// Exporter state.
pub(crate) struct State {
    remote_addr: RemoteAddr,
    namespace: RwLock<String>,
    metrics: Mutex<HashMap<String, Metric>>,
    heartbeat: AtomicU32,
    sending: AtomicBool,
    client: Mutex<Client>,
    clock: Clock,
    telemetry: Telemetry,
    telemetry_enabled: bool,
}

impl State {
    /// Creates a new `State` from the given configuration and transport client.
    pub fn new(config: StateConfiguration, client: Client) -> Self {
        State {
            remote_addr: config.remote_addr,
            namespace: RwLock::new(config.namespace),
            metrics: Mutex::new(HashMap::new()),
            heartbeat: AtomicU32::new(0),
            sending: AtomicBool::new(false),
            client: Mutex::new(client),
            clock: config.clock,
            telemetry: Telemetry::default(),
            telemetry_enabled: config.telemetry,
        }
    }

    pub fn remote_addr(&self) -> &RemoteAddr {
        &self.remote_addr
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn namespace(&self) -> String {
        self.namespace.read().clone()
    }

    pub fn set_namespace(&self, namespace: String) {
        *self.namespace.write() = namespace;
    }

    /// Returns the heartbeat counter that the next flush will send.
    pub fn heartbeat(&self) -> u32 {
        self.heartbeat.load(Relaxed)
    }

    #[cfg(test)]
    pub fn set_heartbeat(&self, heartbeat: u32) {
        self.heartbeat.store(heartbeat, Relaxed);
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Runs `f` against the live metric called `name`, creating it first if necessary.
    pub fn with_metric<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce(&mut Metric) -> R,
    {
        let mut metrics = self.metrics.lock();
        if let Some(metric) = metrics.get_mut(name) {
            return f(metric);
        }

        f(metrics.entry(name.to_owned()).or_insert_with(|| Metric::new(name)))
    }

    /// Returns a copy of the live metric called `name`.
    pub fn get(&self, name: &str) -> Option<Metric> {
        self.metrics.lock().get(name).cloned()
    }

    /// Returns a copy of every live metric.
    pub fn snapshot(&self) -> Vec<Metric> {
        self.metrics.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    /// Flushes all live metrics to the transport.
    pub fn flush(&self) -> FlushOutcome {
        let mut update = TelemetryUpdate::default();
        let outcome = self.flush_inner(&mut update);

        self.telemetry.apply_update(&update);
        if self.telemetry_enabled {
            self.record_telemetry(&update);
        }

        outcome
    }

    fn flush_inner(&self, update: &mut TelemetryUpdate) -> FlushOutcome {
        let Some(_sending) = SendingGuard::acquire(&self.sending) else {
            trace!("Flush already in flight, skipping.");
            update.track_flush_skipped();
            return FlushOutcome::InFlight;
        };

        // Open the endpoint before touching any metrics, so that failing to do so leaves the registry as it was.
        let mut client = self.client.lock();
        if let Err(e) = client.ensure_ready() {
            warn!(error = %e, remote_addr = %self.remote_addr, "Failed to open transport endpoint.");
            update.track_endpoint_unavailable();
            return FlushOutcome::Unavailable;
        }

        let detached = self.detach();
        let heartbeat = self.heartbeat.fetch_add(1, AcqRel);

        let namespace = self.namespace();
        let prefix = Some(namespace.as_str());

        let mut writer = PayloadWriter::new();
        writer.write_heartbeat(prefix, heartbeat, SystemTime::now());
        for metric in detached.values() {
            writer.write_metric(prefix, metric);
        }

        let metrics = detached.len();
        let bytes = writer.len();

        match client.try_send(writer.as_bytes()) {
            Ok(()) => {
                debug!(heartbeat, metrics, bytes, lines = writer.lines_written(), "Flushed metrics.");
                update.track_payload_sent(bytes, metrics);
                FlushOutcome::Sent { heartbeat, metrics, bytes }
            }
            Err(e) => {
                let requeued = self.restore(detached);
                error!(
                    error = %e,
                    remote_addr = %self.remote_addr,
                    heartbeat,
                    metrics,
                    requeued,
                    "Failed to send payload."
                );
                update.track_payload_failed(bytes, requeued);
                FlushOutcome::Failed { heartbeat, metrics: requeued }
            }
        }
    }

    /// Takes every live metric out of the registry, leaving it empty for producers.
    ///
    /// Accumulating metrics are carried straight back into the live registry under the same lock: extended ones as a
    /// whole, simple ones by adding their value onto the fresh metric.
    fn detach(&self) -> HashMap<String, Metric> {
        let mut metrics = self.metrics.lock();
        let detached = std::mem::take(&mut *metrics);

        for metric in detached.values().filter(|m| m.is_accumulating()) {
            let live = metrics
                .entry(metric.name().to_owned())
                .or_insert_with(|| Metric::new(metric.name()));

            if metric.is_extended() {
                live.absorb(metric);
            } else if let Some(value) = metric.simple_value() {
                live.add(value);
            }
            live.set_accumulate(true);
        }

        detached
    }

    /// Puts detached metrics back after a failed send, merging them with anything written since they were detached.
    ///
    /// Returns the number of metrics put back. Accumulating metrics are not counted, since `detach` already carried
    /// them forward.
    fn restore(&self, detached: HashMap<String, Metric>) -> usize {
        let mut metrics = self.metrics.lock();
        let mut restored = 0;
        for (name, metric) in detached {
            if metric.is_accumulating() {
                continue;
            }

            restored += 1;

            match metrics.entry(name) {
                Entry::Occupied(mut entry) => entry.get_mut().absorb(&metric),
                Entry::Vacant(entry) => {
                    entry.insert(metric);
                }
            }
        }

        restored
    }

    fn record_telemetry(&self, update: &TelemetryUpdate) {
        let mut metrics = self.metrics.lock();
        for (suffix, value) in update.counters() {
            let name = format!("{TELEMETRY_PREFIX}.{suffix}");
            metrics.entry(name.clone()).or_insert_with(|| Metric::new(name)).add(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::{
        builder::CarbonStatBuilder, forwarder::mock::MockTransport, metric::Value, registry::CarbonStat,
    };

    use super::FlushOutcome;

    fn stat(namespace: &str) -> (CarbonStat, MockTransport) {
        let transport = MockTransport::default();
        let stat = CarbonStatBuilder::default()
            .with_host("carbon.test")
            .with_port(2003)
            .with_namespace(namespace)
            .with_transport(transport.clone())
            .build();
        (stat, transport)
    }

    /// Splits a payload into `(path, value)` pairs, checking that each line has a timestamp.
    fn points(payload: &str) -> Vec<(String, String)> {
        payload
            .lines()
            .map(|line| {
                let mut fields = line.split(' ');
                let path = fields.next().unwrap().to_string();
                let value = fields.next().unwrap().to_string();
                let ts = fields.next().unwrap();
                assert!(ts.parse::<f64>().is_ok(), "bad timestamp in line '{line}'");
                assert_eq!(fields.next(), None);
                (path, value)
            })
            .collect()
    }

    fn point(path: &str, value: &str) -> (String, String) {
        (path.to_string(), value.to_string())
    }

    fn names(stat: &CarbonStat) -> HashSet<String> {
        stat.snapshot().into_iter().map(|m| m.name().to_string()).collect()
    }

    #[test]
    fn end_to_end_heartbeat_sequence() {
        let (stat, transport) = stat("app");

        for _ in 0..3 {
            stat.metric("hits").incr(1);
        }

        let outcome = stat.flush();
        assert!(matches!(outcome, FlushOutcome::Sent { heartbeat: 0, metrics: 1, .. }));
        assert!(stat.is_empty());

        assert!(stat.flush().is_sent());

        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(points(&payloads[0]), vec![point("app.heartbeat", "0"), point("app.hits", "3")]);
        assert_eq!(points(&payloads[1]), vec![point("app.heartbeat", "1")]);

        let destinations = transport.destinations();
        assert!(destinations.iter().all(|d| d.host() == "carbon.test" && d.port() == 2003));
    }

    #[test]
    fn extended_metric_lines() {
        let (stat, transport) = stat("");

        let latency = stat.metric("latency");
        for value in [1.0, 5.0, 3.0] {
            latency.add_ex(value);
        }
        stat.flush();

        let mut lines = points(&transport.payloads()[0]);
        lines.sort();
        assert_eq!(
            lines,
            vec![
                point("heartbeat", "0"),
                point("latency.avg", "3.0"),
                point("latency.max", "5.0"),
                point("latency.min", "1.0"),
            ]
        );
    }

    #[test]
    fn failed_send_keeps_every_metric() {
        let (stat, transport) = stat("app");
        stat.metric("hits").incr(2);
        stat.metric("latency").add_ex(0.5);
        stat.metric("queue").set(9);
        let before = names(&stat);

        transport.set_fail_send(true);
        let outcome = stat.flush();
        assert_eq!(outcome, FlushOutcome::Failed { heartbeat: 0, metrics: 3 });
        assert!(names(&stat).is_superset(&before));

        assert_eq!(stat.get("hits").unwrap().simple_value(), Some(Value::Integer(2)));
        assert_eq!(stat.get("latency").unwrap().aggregate().count(), 1);
        assert_eq!(stat.get("queue").unwrap().simple_value(), Some(Value::Integer(9)));

        // Heartbeats advance per attempt, and the retained metrics go out with the next payload.
        transport.set_fail_send(false);
        stat.metric("hits").incr(1);
        assert!(matches!(stat.flush(), FlushOutcome::Sent { heartbeat: 1, metrics: 3, .. }));

        let lines = points(&transport.payloads()[0]);
        assert!(lines.contains(&point("app.heartbeat", "1")));
        assert!(lines.contains(&point("app.hits", "3")));
        assert!(lines.contains(&point("app.queue", "9")));
        assert!(lines.contains(&point("app.latency.avg", "0.5")));
    }

    #[test]
    fn failed_send_keeps_writes_made_during_the_send() {
        let (stat, transport) = stat("");
        stat.metric("hits").incr(5);
        stat.metric("queue").set(1);

        let producer = stat.clone();
        transport.on_send(move || {
            producer.metric("hits").incr(2);
            producer.metric("queue").set(7);
            producer.metric("fresh").incr(1);
        });
        transport.set_fail_send(true);

        assert!(matches!(stat.flush(), FlushOutcome::Failed { .. }));

        // Relative writes are summed onto the restored value, absolute writes win over it.
        assert_eq!(stat.get("hits").unwrap().simple_value(), Some(Value::Integer(7)));
        assert_eq!(stat.get("queue").unwrap().simple_value(), Some(Value::Integer(7)));
        assert_eq!(stat.get("fresh").unwrap().simple_value(), Some(Value::Integer(1)));
    }

    #[test]
    fn writes_during_successful_send_wait_for_next_flush() {
        let (stat, transport) = stat("");
        stat.metric("hits").incr(1);

        let producer = stat.clone();
        transport.on_send(move || producer.metric("hits").incr(10));

        assert!(stat.flush().is_sent());
        assert_eq!(stat.get("hits").unwrap().simple_value(), Some(Value::Integer(10)));
        assert!(points(&transport.payloads()[0]).contains(&point("hits", "1")));
    }

    #[test]
    fn unavailable_endpoint_detaches_nothing() {
        let (stat, transport) = stat("");
        stat.metric("hits").incr(4);

        transport.set_fail_open(true);
        assert_eq!(stat.flush(), FlushOutcome::Unavailable);
        assert_eq!(stat.heartbeat(), 0);
        assert_eq!(stat.get("hits").unwrap().simple_value(), Some(Value::Integer(4)));
        assert_eq!(stat.telemetry().endpoints_unavailable, 1);

        transport.set_fail_open(false);
        assert!(matches!(stat.flush(), FlushOutcome::Sent { heartbeat: 0, metrics: 1, .. }));
        assert_eq!(transport.opens(), 1);
    }

    #[test]
    fn failed_send_reopens_endpoint() {
        let (stat, transport) = stat("");

        assert!(stat.flush().is_sent());
        assert!(stat.flush().is_sent());
        assert_eq!(transport.opens(), 1);

        transport.set_fail_send(true);
        assert!(!stat.flush().is_sent());
        transport.set_fail_send(false);
        assert!(stat.flush().is_sent());
        assert_eq!(transport.opens(), 2);
    }

    #[test]
    fn heartbeat_wraps() {
        let (stat, transport) = stat("");
        stat.state().set_heartbeat(u32::MAX);

        assert!(matches!(stat.flush(), FlushOutcome::Sent { heartbeat: u32::MAX, .. }));
        assert!(matches!(stat.flush(), FlushOutcome::Sent { heartbeat: 0, .. }));

        let payloads = transport.payloads();
        assert_eq!(points(&payloads[0]), vec![point("heartbeat", "4294967295")]);
        assert_eq!(points(&payloads[1]), vec![point("heartbeat", "0")]);
    }

    #[test]
    fn reentrant_flush_is_a_noop() {
        let (stat, transport) = stat("");

        let inner = stat.clone();
        let inner_outcomes = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = std::sync::Arc::clone(&inner_outcomes);
        transport.on_send(move || recorded.lock().push(inner.flush()));

        assert!(stat.flush().is_sent());
        assert_eq!(*inner_outcomes.lock(), vec![FlushOutcome::InFlight]);
        assert_eq!(transport.payloads().len(), 1);
        assert_eq!(stat.heartbeat(), 1);

        // The guard is released afterwards.
        assert!(stat.flush().is_sent());
        assert_eq!(stat.telemetry().flushes_skipped, 2);
    }

    #[test]
    fn accumulating_simple_metric_is_summed_across_flushes() {
        let (stat, transport) = stat("");
        let total = stat.metric("total");
        total.set_accumulate(true);
        total.add(4);

        stat.metric("hits").incr(1);

        transport.set_fail_send(true);
        assert_eq!(stat.flush(), FlushOutcome::Failed { heartbeat: 0, metrics: 1 });
        assert_eq!(stat.telemetry().metrics_requeued, 1);
        total.add(6);
        assert_eq!(stat.get("total").unwrap().simple_value(), Some(Value::Integer(10)));

        transport.set_fail_send(false);
        assert!(stat.flush().is_sent());
        total.add(1);

        let metric = stat.get("total").unwrap();
        assert!(metric.is_accumulating());
        assert_eq!(metric.simple_value(), Some(Value::Integer(11)));
        assert!(points(&transport.payloads()[0]).contains(&point("total", "10")));
    }

    #[test]
    fn accumulating_extended_metric_is_carried_forward() {
        let (stat, transport) = stat("");
        let latency = stat.metric("latency");
        latency.set_accumulate(true);
        latency.add_ex(2.0);
        latency.add_ex(4.0);

        assert!(stat.flush().is_sent());
        latency.add_ex(9.0);

        let aggregate = *stat.get("latency").unwrap().aggregate();
        assert_eq!(aggregate.count(), 3);
        assert_eq!(aggregate.min(), Some(2.0));
        assert_eq!(aggregate.max(), Some(9.0));
        assert_eq!(aggregate.avg(), Some(5.0));

        transport.set_fail_send(true);
        assert!(!stat.flush().is_sent());
        assert_eq!(stat.get("latency").unwrap().aggregate().count(), 3);
    }

    #[test]
    fn namespace_is_resolved_at_flush_time() {
        let (stat, transport) = stat("old");
        stat.metric("hits").incr(1);
        stat.set_namespace("new");
        stat.flush();

        assert_eq!(
            points(&transport.payloads()[0]),
            vec![point("new.heartbeat", "0"), point("new.hits", "1")]
        );
    }

    #[test]
    fn telemetry_totals_and_recording() {
        let transport = MockTransport::default();
        let stat = CarbonStatBuilder::default()
            .with_transport(transport.clone())
            .with_telemetry(true)
            .build();

        stat.metric("hits").incr(1);
        let FlushOutcome::Sent { bytes, .. } = stat.flush() else {
            panic!("flush should have been sent");
        };

        let telemetry = stat.telemetry();
        assert_eq!(telemetry.flushes, 1);
        assert_eq!(telemetry.payloads_sent, 1);
        assert_eq!(telemetry.bytes_sent, bytes as u64);
        assert_eq!(telemetry.metrics_flushed, 1);

        let recorded = stat.get("carbonstat.client.payloads_sent").unwrap();
        assert_eq!(recorded.simple_value(), Some(Value::Integer(1)));
        assert!(stat.get("carbonstat.client.payloads_failed").is_none());
    }
}
