//! Ownership and lifecycle of accepted connections.
//!
//! The registry is the only place clients are created and destroyed; a
//! client is present in the map exactly while its descriptor is registered
//! with the event loop, and teardown is idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::conn::{Client, ConnState};
use crate::error::Result;
use crate::io::TlsStream;
use crate::syscalls::{self, EPOLLIN, Poller};

#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<RawFd, Client>,
    /// Live-connection count per listener descriptor.
    per_listener: HashMap<RawFd, usize>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new connection: captures the local endpoint, registers the
    /// descriptor for read events, and takes ownership of the state.
    pub fn add(
        &mut self,
        poller: &Poller,
        fd: RawFd,
        listener: RawFd,
        peer: SocketAddr,
        timeout: Duration,
        tls: Option<Box<dyn TlsStream>>,
    ) -> Result<&mut Client> {
        let local = syscalls::local_addr(fd)?;
        poller.watch(fd, fd as u64, EPOLLIN)?;

        let mut client = Client::new(fd, listener, peer, local, timeout, tls);
        client.state = ConnState::Reading;
        *self.per_listener.entry(listener).or_insert(0) += 1;

        Ok(self.clients.entry(fd).or_insert(client))
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Client> {
        self.clients.get_mut(&fd)
    }

    /// Closes the transport (TLS first, when present) and discards the
    /// client. Unknown descriptors are ignored.
    pub fn shutdown(&mut self, poller: &Poller, fd: RawFd) {
        if let Some(client) = self.clients.get_mut(&fd) {
            client.state = ConnState::Closing;
            if let Some(tls) = client.tls.as_mut() {
                tls.close(fd);
            }
        }
        self.remove(poller, fd);
    }

    /// Unlinks and closes. The descriptor leaves the event loop in the same
    /// step it leaves the map.
    pub fn remove(&mut self, poller: &Poller, fd: RawFd) {
        if let Some(client) = self.clients.remove(&fd) {
            let _ = poller.unwatch(fd);
            syscalls::close(fd);
            if let Some(n) = self.per_listener.get_mut(&client.listener) {
                *n = n.saturating_sub(1);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn listener_load(&self, listener: RawFd) -> usize {
        self.per_listener.get(&listener).copied().unwrap_or(0)
    }

    /// Descriptors whose connections have been quiet longer than `max_idle`.
    pub fn idle_fds(&self, now: Instant, max_idle: Duration) -> Vec<RawFd> {
        self.clients
            .iter()
            .filter(|(_, c)| c.idle_for(now) > max_idle)
            .map(|(&fd, _)| fd)
            .collect()
    }

    /// All live descriptors, for final drain on shutdown.
    pub fn all_fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }
}
