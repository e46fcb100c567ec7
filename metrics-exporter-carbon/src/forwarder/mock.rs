use std::{io, sync::Arc};

use parking_lot::Mutex;

use super::{Endpoint, RemoteAddr, Transport};

type SendHook = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Inner {
    payloads: Vec<(Vec<u8>, RemoteAddr)>,
    opens: usize,
    fail_open: bool,
    fail_send: bool,
}

/// In-memory transport that records every payload it is asked to send.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<Mutex<Inner>>,
    on_send: Arc<Mutex<Option<SendHook>>>,
}

impl MockTransport {
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.lock().fail_open = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.inner.lock().fail_send = fail;
    }

    /// Runs `hook` in the middle of every send, before the outcome is decided.
    pub fn on_send<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.on_send.lock() = Some(Box::new(hook));
    }

    pub fn opens(&self) -> usize {
        self.inner.lock().opens
    }

    pub fn payloads(&self) -> Vec<String> {
        self.inner
            .lock()
            .payloads
            .iter()
            .map(|(payload, _)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub fn destinations(&self) -> Vec<RemoteAddr> {
        self.inner.lock().payloads.iter().map(|(_, addr)| addr.clone()).collect()
    }
}

impl Transport for MockTransport {
    fn open(&self) -> io::Result<Box<dyn Endpoint>> {
        let mut inner = self.inner.lock();
        if inner.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "socket creation refused"));
        }

        inner.opens += 1;
        Ok(Box::new(MockEndpoint { transport: self.clone() }))
    }
}

struct MockEndpoint {
    transport: MockTransport,
}

impl Endpoint for MockEndpoint {
    fn send_to(&mut self, payload: &[u8], addr: &RemoteAddr) -> io::Result<()> {
        // Take the hook out while it runs so that it is free to flush re-entrantly.
        let hook = self.transport.on_send.lock().take();
        if let Some(mut hook) = hook {
            hook();
            *self.transport.on_send.lock() = Some(hook);
        }

        let mut inner = self.transport.inner.lock();
        if inner.fail_send {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "destination unreachable"));
        }

        inner.payloads.push((payload.to_vec(), addr.clone()));
        Ok(())
    }
}
