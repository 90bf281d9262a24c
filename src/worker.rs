//! The single-threaded event loop: accept, read, dispatch, prune.
//!
//! Request reading is event-driven; once a request is complete the whole
//! response is written with the cooperative timeout-bounded primitives, so
//! one slow client can stall the loop for at most `network_timeout` per
//! wait. Every response closes its connection.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::auth::AuthRealm;
use crate::config::Config;
use crate::conn::Client;
use crate::error::{HttpError, Result};
use crate::handler;
use crate::io;
use crate::parser::{self, ParseError};
use crate::registry::ClientRegistry;
use crate::server::Listener;
use crate::syscalls::{self, EPOLLIN, Poller, epoll_event};

/// Upper bound on a request's header block.
pub const MAX_REQUEST_BYTES: usize = 4096;

const EVENT_BATCH: usize = 256;
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

enum Serviced {
    /// Request still incomplete; stay registered and wait for more bytes.
    Wait,
    /// Response finished or the connection is beyond use.
    Close,
}

pub fn run(
    cfg: &Config,
    realms: &[AuthRealm],
    listeners: &HashMap<RawFd, Listener>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let poller = Poller::new()?;
    for &fd in listeners.keys() {
        poller.watch(fd, fd as u64, EPOLLIN)?;
    }

    let mut registry = ClientRegistry::new();
    let mut events = vec![epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
    let mut last_prune = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        let ready: Vec<RawFd> = poller
            .next_events(&mut events, Duration::from_secs(1))?
            .iter()
            .map(|event| event.u64 as RawFd)
            .collect();

        for fd in ready {
            if let Some(listener) = listeners.get(&fd) {
                accept_pending(&poller, &mut registry, cfg, listener);
            } else {
                let outcome = match registry.get_mut(fd) {
                    Some(cl) => {
                        cl.last_active = Instant::now();
                        service(cl, cfg, realms)
                    }
                    None => continue,
                };
                if matches!(outcome, Serviced::Close) {
                    registry.shutdown(&poller, fd);
                }
            }
        }

        if last_prune.elapsed() >= PRUNE_INTERVAL {
            let now = Instant::now();
            for fd in registry.idle_fds(now, cfg.network_timeout) {
                debug!(fd, "closing idle connection");
                registry.shutdown(&poller, fd);
            }
            last_prune = now;
        }
    }

    for fd in registry.all_fds() {
        registry.shutdown(&poller, fd);
    }
    Ok(())
}

/// Drain the accept queue; the listener is edge triggered.
fn accept_pending(
    poller: &Poller,
    registry: &mut ClientRegistry,
    cfg: &Config,
    listener: &Listener,
) {
    loop {
        match syscalls::accept_connection(listener.fd) {
            Ok(Some((fd, peer))) => {
                let tls = listener.tls.map(|factory| factory());
                let added = registry
                    .add(poller, fd, listener.fd, peer, cfg.network_timeout, tls)
                    .map(|_| ());
                match added {
                    Ok(()) => {
                        debug!(fd, %peer, load = registry.listener_load(listener.fd), "accepted")
                    }
                    Err(e) => {
                        warn!(fd, error = %e, "failed to register connection");
                        syscalls::close(fd);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Pulls available bytes, retries the parse, and dispatches once the header
/// block is complete.
fn service(cl: &mut Client, cfg: &Config, realms: &[AuthRealm]) -> Serviced {
    let mut chunk = [0u8; 1024];
    loop {
        match parser::parse_request(&cl.buf) {
            Ok((req, _consumed)) => {
                cl.request = Some(req);
                dispatch(cl, cfg, realms);
                return Serviced::Close;
            }
            Err(ParseError::Incomplete) => {}
            Err(ParseError::InvalidFormat) => {
                let _ =
                    handler::send_error(cl, None, &HttpError::BadRequest("malformed request"));
                return Serviced::Close;
            }
            Err(ParseError::TooLarge) => {
                let _ = handler::send_error(cl, None, &HttpError::TooLarge);
                return Serviced::Close;
            }
        }

        if cl.buf.len() > MAX_REQUEST_BYTES {
            let _ = handler::send_error(cl, None, &HttpError::TooLarge);
            return Serviced::Close;
        }

        match io::recv_available(cl, &mut chunk) {
            Ok(Some(0)) => return Serviced::Close,
            Ok(Some(n)) => cl.buf.extend_from_slice(&chunk[..n]),
            Ok(None) => return Serviced::Wait,
            Err(e) => {
                debug!(fd = cl.fd, error = %e, "read failed");
                return Serviced::Close;
            }
        }
    }
}

fn dispatch(cl: &mut Client, cfg: &Config, realms: &[AuthRealm]) {
    let (method, uri) = match cl.request.as_ref() {
        Some(r) => (r.method.as_str(), r.uri_lossy().into_owned()),
        None => return,
    };
    match handler::serve_request(cl, cfg, realms) {
        Ok(status) => info!(peer = %cl.peer, method, uri = %uri, status, "request"),
        Err(e) => debug!(peer = %cl.peer, method, uri = %uri, error = %e, "request aborted"),
    }
}
