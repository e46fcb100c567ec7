use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use thiserror::Error;

pub mod flusher;

#[cfg(test)]
pub(crate) mod mock;

/// Destination of flushed payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteAddr {
    host: String,
    port: u16,
}

impl RemoteAddr {
    /// Creates a new `RemoteAddr` from the given host and port.
    pub fn new<H>(host: H, port: u16) -> Self
    where
        H: Into<String>,
    {
        Self { host: host.into(), port }
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl TryFrom<&str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &str) -> Result<Self, Self::Error> {
        let (host, port) =
            addr.rsplit_once(':').ok_or_else(|| format!("missing port in '{addr}'"))?;
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        if host.is_empty() {
            return Err(format!("missing host in '{addr}'"));
        }

        let port = port.parse::<u16>().map_err(|e| format!("invalid port '{port}': {e}"))?;
        Ok(RemoteAddr::new(host, port))
    }
}

/// Errors that could occur while handing a payload to the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport endpoint could not be created.
    #[error("transport endpoint unavailable: {0}")]
    Unavailable(io::Error),

    /// The endpoint was available, but sending the payload failed.
    #[error("failed to send payload: {0}")]
    Failure(io::Error),
}

/// A best-effort, connectionless transport.
///
/// Implementations create [`Endpoint`]s, which are cached by the exporter and reused for every flush until a send on
/// them fails, at which point they are discarded and a new one is opened on the next flush.
pub trait Transport: Send + Sync {
    /// Opens a new endpoint.
    ///
    /// # Errors
    ///
    /// If the endpoint cannot be created, an error is returned and the flush is abandoned before any metrics are
    /// taken out of the registry.
    fn open(&self) -> io::Result<Box<dyn Endpoint>>;
}

/// An open transport endpoint.
pub trait Endpoint: Send {
    /// Sends a single payload to the given destination.
    ///
    /// # Errors
    ///
    /// If the payload could not be sent in its entirety, an error is returned.
    fn send_to(&mut self, payload: &[u8], addr: &RemoteAddr) -> io::Result<()>;
}

/// UDP transport.
///
/// Each endpoint is an unconnected IPv4 UDP socket bound to an ephemeral port. The destination host is resolved on every
/// send, so DNS changes are picked up without reopening the socket. Only IPv4 addresses of the host are used.
pub struct UdpTransport {
    write_timeout: Duration,
}

impl UdpTransport {
    /// Creates a new `UdpTransport` with the given write timeout.
    pub fn new(write_timeout: Duration) -> Self {
        Self { write_timeout }
    }
}

impl Transport for UdpTransport {
    fn open(&self) -> io::Result<Box<dyn Endpoint>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_write_timeout(Some(self.write_timeout))?;
        Ok(Box::new(UdpEndpoint { socket }))
    }
}

struct UdpEndpoint {
    socket: UdpSocket,
}

impl Endpoint for UdpEndpoint {
    fn send_to(&mut self, payload: &[u8], addr: &RemoteAddr) -> io::Result<()> {
        let sent = self.socket.send_to(payload, resolve_ipv4(addr)?)?;
        if sent < payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated ({sent} of {} bytes sent)", payload.len()),
            ));
        }

        Ok(())
    }
}

/// Resolves the destination to its first IPv4 address, matching the address family of the endpoint socket.
fn resolve_ipv4(addr: &RemoteAddr) -> io::Result<SocketAddr> {
    (addr.host(), addr.port())
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no IPv4 address for {addr}"))
        })
}

enum ClientState {
    // No endpoint is open; one is opened on the next flush.
    Disconnected,

    // Endpoint is open and ready to send payloads.
    Ready(Box<dyn Endpoint>),
}

/// Lazily opened, cached transport endpoint.
pub(crate) struct Client {
    transport: Box<dyn Transport>,
    remote_addr: RemoteAddr,
    state: ClientState,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>, remote_addr: RemoteAddr) -> Self {
        Self { transport, remote_addr, state: ClientState::Disconnected }
    }

    /// Opens an endpoint if one is not already open.
    pub fn ensure_ready(&mut self) -> Result<(), TransportError> {
        if let ClientState::Disconnected = self.state {
            let endpoint = self.transport.open().map_err(TransportError::Unavailable)?;
            self.state = ClientState::Ready(endpoint);
        }

        Ok(())
    }

    /// Sends a payload over the open endpoint.
    ///
    /// A failed send drops the endpoint, so the next flush opens a fresh one.
    pub fn try_send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let ClientState::Ready(endpoint) = &mut self.state else {
            return Err(TransportError::Failure(io::Error::new(
                io::ErrorKind::NotConnected,
                "no open endpoint",
            )));
        };

        match endpoint.send_to(payload, &self.remote_addr) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = ClientState::Disconnected;
                Err(TransportError::Failure(e))
            }
        }
    }
}
