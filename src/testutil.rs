//! Shared fixtures for unit tests: an in-memory transport and a canned
//! configuration.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Config, DEFAULT_INDEX_FILES};
use crate::conn::Client;
use crate::io::TlsStream;

/// In-memory transport: captures sends, replays scripted reads, and can
/// simulate short writes.
pub struct MemStream {
    pub sent: Arc<Mutex<Vec<u8>>>,
    pub incoming: VecDeque<Vec<u8>>,
    /// Per-call cap on accepted bytes; None accepts everything.
    pub write_quota: Option<usize>,
}

impl TlsStream for MemStream {
    fn send(&mut self, _fd: RawFd, data: &[u8]) -> io::Result<usize> {
        let take = match self.write_quota {
            Some(q) => q.min(data.len()),
            None => data.len(),
        };
        self.sent.lock().unwrap().extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn recv(&mut self, _fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        match self.incoming.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn close(&mut self, _fd: RawFd) {}
}

/// A client wired to a MemStream; returns the capture buffer alongside.
pub fn mem_client(incoming: Vec<Vec<u8>>, write_quota: Option<usize>) -> (Client, Arc<Mutex<Vec<u8>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let stream = MemStream {
        sent: sent.clone(),
        incoming: incoming.into(),
        write_quota,
    };
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let client = Client::new(
        -1,
        -1,
        addr,
        addr,
        Duration::from_secs(1),
        Some(Box::new(stream)),
    );
    (client, sent)
}

pub fn test_config(docroot: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        docroot: docroot.to_path_buf(),
        realm: "Protected Area".to_string(),
        network_timeout: Duration::from_secs(1),
        no_symlinks: false,
        no_dirlists: false,
        index_files: DEFAULT_INDEX_FILES.iter().map(|s| s.to_string()).collect(),
    }
}
