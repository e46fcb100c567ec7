use std::{io, sync::Arc, time::Duration};

use crate::{
    builder::CarbonStatBuilder,
    forwarder::{flusher::Flusher, RemoteAddr},
    metric::{Metric, Value},
    recorder::CarbonStatRecorder,
    state::{FlushOutcome, State},
    telemetry::TelemetrySnapshot,
    timer::{ScopedTimer, Timer},
};

/// A registry of metrics that are periodically flushed to Carbon.
///
/// `CarbonStat` is a cheap handle to shared state: clones refer to the same set of metrics, so it can be handed to every
/// component that records metrics and to whatever drives [`flush`](CarbonStat::flush).
///
/// ```no_run
/// # use metrics_exporter_carbon::CarbonStat;
/// let stat = CarbonStat::builder()
///     .with_remote_address("127.0.0.1:2003")
///     .expect("failed to parse remote address")
///     .with_namespace("app")
///     .build();
///
/// stat.metric("requests").incr(1);
/// stat.time("render", || {
///     // ...
/// });
///
/// stat.flush();
/// ```
#[derive(Clone)]
pub struct CarbonStat {
    state: Arc<State>,
}

impl CarbonStat {
    pub(crate) fn new(state: Arc<State>) -> Self {
        Self { state }
    }

    /// Creates a [`CarbonStatBuilder`] with the default configuration.
    pub fn builder() -> CarbonStatBuilder {
        CarbonStatBuilder::default()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &State {
        &self.state
    }

    /// Returns a handle to the metric called `name`.
    ///
    /// The metric is created in the registry on first use. Every operation on the handle is applied to whichever metric
    /// is live under that name at the time, so handles can be held across flushes.
    pub fn metric<N>(&self, name: N) -> MetricHandle
    where
        N: Into<Arc<str>>,
    {
        MetricHandle { state: Arc::clone(&self.state), name: name.into() }
    }

    /// Returns a copy of the live metric called `name`, if it exists.
    pub fn get(&self, name: &str) -> Option<Metric> {
        self.state.get(name)
    }

    /// Returns a copy of every live metric.
    pub fn snapshot(&self) -> Vec<Metric> {
        self.state.snapshot()
    }

    /// Returns the number of live metrics.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Returns `true` if there are no live metrics.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the destination of flushed payloads.
    pub fn remote_addr(&self) -> &RemoteAddr {
        self.state.remote_addr()
    }

    /// Returns the current namespace.
    pub fn namespace(&self) -> String {
        self.state.namespace()
    }

    /// Sets the namespace applied to every metric path, including metrics created earlier.
    pub fn set_namespace<N>(&self, namespace: N)
    where
        N: Into<String>,
    {
        self.state.set_namespace(namespace.into());
    }

    /// Returns the heartbeat counter that the next flush will send.
    pub fn heartbeat(&self) -> u32 {
        self.state.heartbeat()
    }

    /// Returns a running timer recording into the metric called `name`.
    pub fn timer<N>(&self, name: N) -> Timer
    where
        N: Into<Arc<str>>,
    {
        self.metric(name).timer()
    }

    /// Calls `f`, recording how long it took into the metric called `name`.
    pub fn time<N, F, R>(&self, name: N, f: F) -> R
    where
        N: Into<Arc<str>>,
        F: FnOnce() -> R,
    {
        let _timer = self.timer(name).scoped();
        f()
    }

    /// Wraps `f` so that every call is timed into the metric called `name`.
    ///
    /// Functions of several arguments can be wrapped by taking them as a tuple.
    pub fn wrap<N, F, T, R>(&self, name: N, f: F) -> impl Fn(T) -> R
    where
        N: Into<Arc<str>>,
        F: Fn(T) -> R,
    {
        let metric = self.metric(name);
        move |arg| {
            let _timer = metric.scoped_timer();
            f(arg)
        }
    }

    /// Flushes every live metric to the remote collector in a single payload.
    ///
    /// See [`FlushOutcome`] for the possible results. Transport failures are logged and recovered from locally: metrics
    /// that could not be sent stay in the registry for the next flush.
    pub fn flush(&self) -> FlushOutcome {
        self.state.flush()
    }

    /// Returns the exporter's own telemetry totals.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.state.telemetry()
    }

    /// Spawns a background thread that flushes this registry every `interval`.
    ///
    /// # Errors
    ///
    /// If the thread cannot be spawned, an error is returned.
    pub fn spawn_flusher(&self, interval: Duration) -> io::Result<Flusher> {
        Flusher::spawn(self.clone(), interval)
    }

    /// Returns a [`metrics::Recorder`] that records into this registry.
    pub fn recorder(&self) -> CarbonStatRecorder {
        CarbonStatRecorder::new(self.clone())
    }
}

/// A handle to a named metric in a [`CarbonStat`] registry.
#[derive(Clone)]
pub struct MetricHandle {
    state: Arc<State>,
    name: Arc<str>,
}

impl MetricHandle {
    /// Returns the name of the metric.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Metric) -> R,
    {
        self.state.with_metric(&self.name, f)
    }

    /// Adds `value` to the simple value.
    pub fn add<V>(&self, value: V)
    where
        V: Into<Value>,
    {
        let value = value.into();
        self.with(|m| m.add(value));
    }

    /// Increments the simple value by `amount`.
    pub fn incr<V>(&self, amount: V)
    where
        V: Into<Value>,
    {
        self.add(amount);
    }

    /// Decrements the simple value by `amount`.
    pub fn decr<V>(&self, amount: V)
    where
        V: Into<Value>,
    {
        self.add(-amount.into());
    }

    /// Replaces the simple value with `value`.
    pub fn set<V>(&self, value: V)
    where
        V: Into<Value>,
    {
        let value = value.into();
        self.with(|m| m.set(value));
    }

    /// Records an extended observation.
    pub fn add_ex(&self, value: f64) {
        self.with(|m| m.add_ex(value));
    }

    /// Marks the metric as carried forward across flushes.
    ///
    /// Accumulating metrics are never cleared by a flush: their simple value keeps being added to, and their extended
    /// aggregate keeps collecting observations, for the life of the registry.
    pub fn set_accumulate(&self, accumulate: bool) {
        self.with(|m| m.set_accumulate(accumulate));
    }

    /// Returns a running timer recording into this metric.
    pub fn timer(&self) -> Timer {
        self.with(Metric::mark_extended);
        Timer::new(self.clone(), self.state.clock().clone())
    }

    /// Returns a running timer that records into this metric when dropped.
    pub fn scoped_timer(&self) -> ScopedTimer {
        self.timer().scoped()
    }

    /// Returns a copy of the live metric, if it exists.
    pub fn snapshot(&self) -> Option<Metric> {
        self.state.get(&self.name)
    }
}
