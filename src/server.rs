//! Listener bootstrap and the server lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::info;

use crate::auth::{self, AuthRealm};
use crate::config::Config;
use crate::error::{HttpError, Result};
use crate::io::TlsStream;
use crate::syscalls;
use crate::worker;

/// Produces the per-connection encrypted-transport hooks for a listener
/// that terminates TLS.
pub type TlsFactory = fn() -> Box<dyn TlsStream>;

/// An accepting socket and the transport its connections speak.
pub struct Listener {
    pub fd: RawFd,
    pub addr: SocketAddr,
    pub tls: Option<TlsFactory>,
}

pub struct Server {
    config: Config,
    realms: Vec<AuthRealm>,
    listeners: HashMap<RawFd, Listener>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Builds a server over a finalized configuration. Fails when the
    /// document root cannot be pinned down.
    pub fn new(mut config: Config) -> Result<Self> {
        config.finalize()?;
        Ok(Self {
            config,
            realms: Vec::new(),
            listeners: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers an auth realm; system-database resolution for `$p$account`
    /// passwords happens here, at bootstrap. Returns false when the realm
    /// could not be materialized.
    pub fn add_realm(&mut self, path: &str, user: &str, pass: &str) -> bool {
        auth::realm_add(&mut self.realms, path, user, pass)
    }

    /// Flag checked by the event loop once per wait; setting it drains and
    /// stops the server. Handed to the signal hook by the binary.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Binds a plain-TCP listener on the configured address and returns the
    /// actual local endpoint (useful with port 0).
    pub fn bind(&mut self) -> Result<SocketAddr> {
        self.bind_with_tls(None)
    }

    pub fn bind_with_tls(&mut self, tls: Option<TlsFactory>) -> Result<SocketAddr> {
        let fd = syscalls::create_listen_socket(&self.config.host, self.config.port)?;
        let addr = syscalls::local_addr(fd)?;
        self.listeners.insert(fd, Listener { fd, addr, tls });
        info!(%addr, docroot = %self.config.docroot.display(), "listening");
        Ok(addr)
    }

    /// Runs the event loop on the calling thread until the shutdown flag is
    /// set or the loop itself fails.
    pub fn run(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(HttpError::Internal("no listeners bound"));
        }
        worker::run(&self.config, &self.realms, &self.listeners, &self.shutdown)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for fd in self.listeners.keys() {
            syscalls::close(*fd);
        }
    }
}
