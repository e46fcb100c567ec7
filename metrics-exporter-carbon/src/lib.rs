//! A metrics aggregator that flushes batched metrics to a [Carbon][carbon] server over UDP.
//!
//! [carbon]: https://graphite.readthedocs.io/en/latest/feeding-carbon.html
//!
//! # Usage
//!
//! Metrics are recorded into a [`CarbonStat`] registry, and sent to the remote server every time the registry is
//! flushed:
//!
//! ```no_run
//! # use metrics_exporter_carbon::CarbonStatBuilder;
//! // First, create a builder.
//! //
//! // The builder can configure the remote address, the namespace prefixed to every metric path, the flush interval of
//! // the background flusher, and more. `CarbonStatBuilder::from_env` reads the remote address and namespace from the
//! // `CARBON_HOST`, `CARBON_PORT` and `CARBON_NAMESPACE` environment variables.
//! let stat = CarbonStatBuilder::default()
//!     .with_remote_address("127.0.0.1:2003")
//!     .expect("failed to parse remote address")
//!     .with_namespace("app")
//!     .build();
//!
//! // Simple values are added to or set directly, and extended values collect observations.
//! stat.metric("requests").incr(1);
//! stat.metric("queue_depth").set(12);
//! stat.time("render", || {
//!     // ...
//! });
//!
//! // Flushing sends everything recorded since the previous flush as one payload.
//! stat.flush();
//! ```
//!
//! Most applications will rather "install" the registry, which sets it as the global recorder for all `metrics` calls
//! and spawns a background thread that flushes on a fixed interval:
//!
//! ```no_run
//! # use metrics_exporter_carbon::CarbonStatBuilder;
//! let flusher = CarbonStatBuilder::default().install().expect("failed to install recorder/exporter");
//!
//! metrics::counter!("requests").increment(1);
//!
//! // Stops the background thread after one final flush.
//! flusher.shutdown();
//! ```
//!
//! # Features
//!
//! ## Wire format
//!
//! Payloads use the Carbon plaintext protocol, one `<path> <value> <timestamp>` line per value. Every payload starts
//! with a heartbeat line carrying a counter that goes up by one on every flush attempt, which lets the receiving side
//! detect lost payloads:
//!
//! ```text
//! app.heartbeat 7 1700000000.0
//! app.requests 42 1699999998.25
//! app.render.min 0.012 1699999999.5
//! app.render.avg 0.018 1699999999.5
//! app.render.max 0.031 1699999999.5
//! ```
//!
//! ## Extended metrics
//!
//! Metrics that record observations (through [`MetricHandle::add_ex`], timers, or `metrics` histograms) report the
//! minimum, average and maximum of the observations made since the previous flush.
//!
//! ## Accumulating metrics
//!
//! Metrics marked with [`MetricHandle::set_accumulate`] are carried forward across flushes instead of being cleared,
//! so they report running totals for the life of the registry.
//!
//! ## Failure handling
//!
//! Flushing never blocks producers for longer than it takes to swap out the set of live metrics. If the payload cannot
//! be sent, the metrics it held are merged back into the registry, together with anything recorded while the send was
//! in progress, and go out with the next flush.
//!
//! ## Telemetry
//!
//! The exporter can capture its own internal telemetry around flushes, payloads and bytes sent or failed, metrics
//! re-queued, and so on. This telemetry is recorded under the `carbonstat.client` namespace and sent to the same remote
//! server as everything else.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, CarbonStatBuilder, ENV_HOST, ENV_NAMESPACE, ENV_PORT};

mod forwarder;
pub use self::forwarder::{
    flusher::Flusher, Endpoint, RemoteAddr, Transport, TransportError, UdpTransport,
};

mod metric;
pub use self::metric::{Aggregate, Metric, Simple, Value};

mod recorder;
pub use self::recorder::CarbonStatRecorder;

mod registry;
pub use self::registry::{CarbonStat, MetricHandle};

mod state;
pub use self::state::FlushOutcome;

mod telemetry;
pub use self::telemetry::TelemetrySnapshot;

mod timer;
pub use self::timer::{ScopedTimer, Timer, TimerError};

mod writer;
pub use self::writer::PayloadWriter;
