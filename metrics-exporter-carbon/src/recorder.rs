use std::sync::Arc;

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};

use crate::registry::{CarbonStat, MetricHandle};

/// A recorder that feeds a [`CarbonStat`] registry.
///
/// Counters and gauges map onto simple values: increments are added, and absolute values are set. Gauges are marked as
/// accumulating, so their level carries across flushes instead of restarting from zero. Histograms map onto
/// the extended aggregate, with every recorded value becoming one observation. Labels are rendered as Graphite tags,
/// so `requests` with the label `method=GET` is stored as `requests;method=GET`.
pub struct CarbonStatRecorder {
    stat: CarbonStat,
}

impl CarbonStatRecorder {
    pub(crate) fn new(stat: CarbonStat) -> Self {
        CarbonStatRecorder { stat }
    }

    /// Returns the registry this recorder feeds.
    pub fn stat(&self) -> &CarbonStat {
        &self.stat
    }

    fn handle(&self, key: &Key) -> Arc<MetricHandle> {
        Arc::new(self.stat.metric(metric_path(key)))
    }
}

fn metric_path(key: &Key) -> String {
    let mut path = key.name().to_string();
    for label in key.labels() {
        path.push(';');
        path.push_str(label.key());
        path.push('=');
        path.push_str(label.value());
    }

    path
}

impl Recorder for CarbonStatRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.handle(key))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let handle = self.handle(key);
        handle.set_accumulate(true);
        Gauge::from_arc(handle)
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.handle(key))
    }
}

impl CounterFn for MetricHandle {
    fn increment(&self, value: u64) {
        self.add(value);
    }

    fn absolute(&self, value: u64) {
        self.set(value);
    }
}

impl GaugeFn for MetricHandle {
    fn increment(&self, value: f64) {
        self.add(value);
    }

    fn decrement(&self, value: f64) {
        self.add(-value);
    }

    fn set(&self, value: f64) {
        MetricHandle::set(self, value);
    }
}

impl HistogramFn for MetricHandle {
    fn record(&self, value: f64) {
        self.add_ex(value);
    }
}
