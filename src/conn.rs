use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::http::Request;
use crate::io::TlsStream;

/// Per-connection lifecycle. Errors jump straight to Closing; Closing is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Accepted = 0,
    Reading = 1,
    Dispatching = 2,
    Responding = 3,
    Closing = 4,
}

/// State owned by the registry for one accepted connection.
pub struct Client {
    pub fd: RawFd,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Descriptor of the listener this connection arrived on.
    pub listener: RawFd,
    pub state: ConnState,
    /// Raw request bytes accumulated so far.
    pub buf: Vec<u8>,
    /// The parsed request, once the header block is complete.
    pub request: Option<Request>,
    pub last_active: Instant,
    /// Per-wait I/O budget, from Config::network_timeout.
    pub timeout: Duration,
    /// Encrypted-transport hooks; None speaks plain TCP.
    pub tls: Option<Box<dyn TlsStream>>,
}

impl Client {
    pub fn new(
        fd: RawFd,
        listener: RawFd,
        peer: SocketAddr,
        local: SocketAddr,
        timeout: Duration,
        tls: Option<Box<dyn TlsStream>>,
    ) -> Self {
        Self {
            fd,
            peer,
            local,
            listener,
            state: ConnState::Accepted,
            buf: Vec::with_capacity(512),
            request: None,
            last_active: Instant::now(),
            timeout,
            tls,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }
}
