use std::{sync::Arc, time::Duration};

use quanta::Clock;
use thiserror::Error;

use crate::{
    forwarder::{flusher::Flusher, Client, RemoteAddr, Transport, UdpTransport},
    registry::CarbonStat,
    state::{State, StateConfiguration},
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2003;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Environment variable holding the Carbon host.
pub const ENV_HOST: &str = "CARBON_HOST";

/// Environment variable holding the Carbon port.
pub const ENV_PORT: &str = "CARBON_PORT";

/// Environment variable holding the metric namespace.
pub const ENV_NAMESPACE: &str = "CARBON_NAMESPACE";

/// Errors that could occur while building or installing a Carbon recorder/exporter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// Failed to parse the remote port.
    #[error("invalid port '{value}'")]
    InvalidPort {
        /// The value that could not be parsed.
        value: String,
    },

    /// Failed to spawn the background flusher thread.
    #[error("failed to spawn background thread for exporter")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install exporter as global recorder")]
    FailedToInstall,
}

/// Builder for a [`CarbonStat`] registry.
pub struct CarbonStatBuilder {
    remote_addr: RemoteAddr,
    namespace: String,
    write_timeout: Duration,
    flush_interval: Duration,
    telemetry: bool,
    transport: Option<Box<dyn Transport>>,
    clock: Option<Clock>,
}

impl CarbonStatBuilder {
    /// Creates a builder configured from the `CARBON_HOST`, `CARBON_PORT` and `CARBON_NAMESPACE` environment variables.
    ///
    /// Variables that are not set keep their default values.
    ///
    /// # Errors
    ///
    /// If `CARBON_PORT` is set but is not a valid port number, an error will be returned.
    pub fn from_env() -> Result<Self, BuildError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Creates a builder configured from the given variable lookup.
    ///
    /// This behaves like [`from_env`](CarbonStatBuilder::from_env), but reads variables through `lookup` instead of
    /// the process environment.
    ///
    /// # Errors
    ///
    /// If the port variable is set but is not a valid port number, an error will be returned.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, BuildError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::default();

        if let Some(host) = lookup(ENV_HOST) {
            builder = builder.with_host(host);
        }

        if let Some(port) = lookup(ENV_PORT) {
            let port = port.trim().parse::<u16>().map_err(|_| BuildError::InvalidPort { value: port })?;
            builder = builder.with_port(port);
        }

        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            builder = builder.with_namespace(namespace);
        }

        Ok(builder)
    }

    /// Set the remote address to flush metrics to, in the format of `<host>:<port>`.
    ///
    /// Defaults to `127.0.0.1:2003`.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the remote host to flush metrics to.
    ///
    /// Defaults to `127.0.0.1`.
    #[must_use]
    pub fn with_host<H>(mut self, host: H) -> Self
    where
        H: Into<String>,
    {
        self.remote_addr = RemoteAddr::new(host, self.remote_addr.port());
        self
    }

    /// Set the remote port to flush metrics to.
    ///
    /// Defaults to 2003.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.remote_addr = RemoteAddr::new(self.remote_addr.host(), port);
        self
    }

    /// Set the namespace that prefixes every metric path.
    ///
    /// An empty namespace means paths are not prefixed. The namespace can also be changed after building with
    /// [`CarbonStat::set_namespace`].
    ///
    /// Defaults to an empty namespace.
    #[must_use]
    pub fn with_namespace<N>(mut self, namespace: N) -> Self
    where
        N: Into<String>,
    {
        self.namespace = namespace.into();
        self
    }

    /// Set the write timeout of the default UDP transport.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the interval at which the flusher spawned by [`install`](CarbonStatBuilder::install) flushes metrics.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Sets whether or not to record telemetry about the exporter itself.
    ///
    /// When enabled, counters describing each flush (payloads and bytes sent or failed, metrics flushed or re-queued,
    /// and so on) are recorded into the registry under `carbonstat.client`, and sent along with the next flush.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Use a custom transport instead of UDP.
    #[must_use]
    pub fn with_transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Use the given clock for timers.
    ///
    /// Defaults to [`Clock::new`].
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the registry.
    ///
    /// Nothing is flushed until [`CarbonStat::flush`] is called, either directly or by a flusher spawned with
    /// [`CarbonStat::spawn_flusher`].
    pub fn build(self) -> CarbonStat {
        let transport: Box<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Box::new(UdpTransport::new(self.write_timeout)),
        };
        let client = Client::new(transport, self.remote_addr.clone());

        let state_config = StateConfiguration {
            remote_addr: self.remote_addr,
            namespace: self.namespace,
            telemetry: self.telemetry,
            clock: self.clock.unwrap_or_else(Clock::new),
        };

        CarbonStat::new(Arc::new(State::new(state_config, client)))
    }

    /// Builds the registry, installs it as the global recorder, and spawns a background flusher.
    ///
    /// The flusher flushes at the configured flush interval until it is shut down or dropped. The registry can be
    /// reached through [`Flusher::stat`].
    ///
    /// # Errors
    ///
    /// If the background thread cannot be spawned, or if a global recorder is already installed, an error will be
    /// returned.
    pub fn install(self) -> Result<Flusher, BuildError> {
        let flush_interval = self.flush_interval;
        let stat = self.build();

        let flusher = stat.spawn_flusher(flush_interval).map_err(|_| BuildError::Backend)?;
        metrics::set_global_recorder(stat.recorder()).map_err(|_| BuildError::FailedToInstall)?;

        Ok(flusher)
    }
}

impl Default for CarbonStatBuilder {
    fn default() -> Self {
        CarbonStatBuilder {
            remote_addr: RemoteAddr::new(DEFAULT_HOST, DEFAULT_PORT),
            namespace: String::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            telemetry: false,
            transport: None,
            clock: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::forwarder::RemoteAddr;

    use super::{BuildError, CarbonStatBuilder, ENV_HOST, ENV_NAMESPACE, ENV_PORT};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let stat = CarbonStatBuilder::default().build();
        assert_eq!(stat.remote_addr(), &RemoteAddr::new("127.0.0.1", 2003));
        assert_eq!(stat.namespace(), "");
        assert_eq!(stat.heartbeat(), 0);
    }

    #[test]
    fn from_env_reads_all_variables() {
        let builder = CarbonStatBuilder::from_env_with(lookup(&[
            (ENV_HOST, "carbon.internal"),
            (ENV_PORT, "2013"),
            (ENV_NAMESPACE, "svc.web"),
        ]))
        .unwrap();

        let stat = builder.build();
        assert_eq!(stat.remote_addr(), &RemoteAddr::new("carbon.internal", 2013));
        assert_eq!(stat.namespace(), "svc.web");
    }

    #[test]
    fn from_env_keeps_defaults_for_missing_variables() {
        let stat = CarbonStatBuilder::from_env_with(lookup(&[(ENV_PORT, "2004")])).unwrap().build();
        assert_eq!(stat.remote_addr(), &RemoteAddr::new("127.0.0.1", 2004));
        assert_eq!(stat.namespace(), "");
    }

    #[test]
    fn from_env_rejects_bad_port() {
        let result = CarbonStatBuilder::from_env_with(lookup(&[(ENV_PORT, "carbon")]));
        assert!(matches!(result, Err(BuildError::InvalidPort { value }) if value == "carbon"));
    }

    #[test]
    fn remote_address() {
        let stat = CarbonStatBuilder::default()
            .with_remote_address("graphite.local:2103")
            .unwrap()
            .build();
        assert_eq!(stat.remote_addr(), &RemoteAddr::new("graphite.local", 2103));

        let result = CarbonStatBuilder::default().with_remote_address("graphite.local");
        assert!(matches!(result, Err(BuildError::InvalidRemoteAddress { .. })));
    }

    #[test]
    fn host_and_port_are_independent() {
        let stat = CarbonStatBuilder::default().with_port(9999).with_host("example.com").build();
        assert_eq!(stat.remote_addr(), &RemoteAddr::new("example.com", 9999));
    }
}
