//! Timeout-bounded send/recv on nonblocking descriptors, and the chunked
//! body encoder.
//!
//! These primitives implement their own readiness waits with a
//! single-descriptor poll; while one of those waits is in progress no other
//! connection makes progress. That is a deliberate trade for simplicity:
//! the deployment targets serve at most dozens of concurrent clients.

use std::io;
use std::os::fd::RawFd;

use crate::conn::Client;
use crate::error::{HttpError, Result};
use crate::http::Version;
use crate::syscalls;

/// Hook contract for encrypted transports. Implementations report
/// `WouldBlock` through `io::Error` exactly like the plain syscalls so the
/// retry logic above them stays transport-agnostic.
pub trait TlsStream {
    fn send(&mut self, fd: RawFd, data: &[u8]) -> io::Result<usize>;
    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&mut self, fd: RawFd);
}

fn send_once(cl: &mut Client, data: &[u8]) -> io::Result<usize> {
    match cl.tls.as_mut() {
        Some(t) => t.send(cl.fd, data),
        None => syscalls::send_raw(cl.fd, data),
    }
}

fn recv_once(cl: &mut Client, buf: &mut [u8]) -> io::Result<usize> {
    match cl.tls.as_mut() {
        Some(t) => t.recv(cl.fd, buf),
        None => syscalls::recv_raw(cl.fd, buf),
    }
}

/// Writes all of `data`, looping over short writes. Interrupted writes are
/// retried; a not-ready descriptor is waited on for up to the client's
/// timeout. A zero-length write is treated as a closed connection rather
/// than retried, which avoids the tight spin loops nonblocking sockets
/// otherwise produce.
pub fn send(cl: &mut Client, data: &[u8]) -> Result<()> {
    let mut off = 0;
    while off < data.len() {
        match send_once(cl, &data[off..]) {
            Ok(0) => return Err(HttpError::ConnectionClosed),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !syscalls::poll_ready(cl.fd, true, cl.timeout)? {
                    return Err(HttpError::Timeout);
                }
            }
            Err(_) => return Err(HttpError::ConnectionClosed),
        }
    }
    Ok(())
}

/// Reads some bytes, waiting up to the client's timeout for the descriptor
/// to become readable. Zero means the peer closed.
pub fn recv(cl: &mut Client, buf: &mut [u8]) -> Result<usize> {
    loop {
        match recv_once(cl, buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !syscalls::poll_ready(cl.fd, false, cl.timeout)? {
                    return Err(HttpError::Timeout);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reads whatever is immediately available. `Ok(None)` means the descriptor
/// has nothing right now; the caller goes back to the event loop.
pub fn recv_available(cl: &mut Client, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match recv_once(cl, buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Emits one chunk of a chunked-encoded body: uppercase-hex length line,
/// payload, CRLF. An empty payload emits the stream terminator instead.
pub fn send_chunk(cl: &mut Client, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return send(cl, b"0\r\n\r\n");
    }
    let head = format!("{:X}\r\n", data.len());
    send(cl, head.as_bytes())?;
    send(cl, data)?;
    send(cl, b"\r\n")
}

/// Version-aware body write: HTTP/1.1 responses are chunk-encoded, earlier
/// protocols get the raw bytes. With chunking in effect an empty slice
/// terminates the body.
pub fn send_body(cl: &mut Client, version: Version, data: &[u8]) -> Result<()> {
    match version {
        Version::V11 => send_chunk(cl, data),
        _ => send(cl, data),
    }
}
