//! Thin wrappers over the raw socket, epoll and password-database calls.
//!
//! Everything here is Linux-first: the deployment targets are embedded
//! routers and appliances.

use crate::error::{HttpError, Result};
use libc::{c_int, c_void, socklen_t};
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

/// Symbols the `libc` crate does not export. `crypt(3)` lives in libcrypt
/// on glibc systems.
mod ffi {
    use libc::c_char;

    #[link(name = "crypt")]
    unsafe extern "C" {
        pub fn crypt(key: *const c_char, setting: *const c_char) -> *mut c_char;
    }
}

/// Folds the -1-means-error syscall convention into a Result.
fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: isize) -> io::Result<usize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

// ---- Socket operations ----

/// Create a non-blocking TCP listener bound to `host:port`.
pub fn create_listen_socket(host: &str, port: u16) -> Result<RawFd> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let raw = cvt(unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) })?;
    // Owns the descriptor until setup succeeds end to end; any early return
    // below closes it.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    set_sockopt(sock.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    // Inherited by every accepted connection.
    set_sockopt(sock.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;

    let (storage, len) = encode_sockaddr(&addr);
    cvt(unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    })?;
    cvt(unsafe { libc::listen(sock.as_raw_fd(), libc::SOMAXCONN) })?;

    Ok(sock.into_raw_fd())
}

fn set_sockopt(fd: RawFd, level: c_int, option: c_int, value: c_int) -> Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    })?;
    Ok(())
}

/// Accept one pending connection, non-blocking. `Ok(None)` means the accept
/// queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let accepted = cvt(unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        )
    });
    match accepted {
        Ok(fd) => Ok(Some((fd, decode_sockaddr(&storage).unwrap_or(UNSPECIFIED)))),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e.into()),
    }
}

const UNSPECIFIED: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// Local endpoint of a connected socket, via getsockname.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(decode_sockaddr(&storage).unwrap_or(UNSPECIFIED))
}

/// Writes `addr` into a sockaddr_storage and reports the populated length.
fn encode_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn decode_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

// ---- Nonblocking I/O ----

/// One nonblocking write attempt. `WouldBlock` and `Interrupted` surface as
/// their io::ErrorKind so the caller can wait or retry.
pub fn send_raw(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_size(unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    })
}

/// One nonblocking read attempt. A zero return is end-of-stream.
pub fn recv_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) })
}

/// Wait for a single descriptor to become readable or writable, up to
/// `timeout`. Returns false if the timeout elapsed first.
pub fn poll_ready(fd: RawFd, write: bool, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: if write { libc::POLLOUT } else { libc::POLLIN },
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as c_int;

    loop {
        match cvt(unsafe { libc::poll(&mut pfd, 1, ms) }) {
            Ok(n) => return Ok(n > 0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Event readiness ----

pub use libc::{EPOLLIN, epoll_event};

/// The event loop's readiness source: an epoll instance watching the
/// listener and every live connection, edge triggered.
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let raw = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    fn ctl(&self, op: c_int, fd: RawFd, event: Option<&mut epoll_event>) -> io::Result<()> {
        let ev_ptr = match event {
            Some(e) => e as *mut epoll_event,
            None => ptr::null_mut(),
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ev_ptr) }).map(|_| ())
    }

    /// Starts watching `fd`; `token` comes back with every event for it.
    pub fn watch(&self, fd: RawFd, token: u64, interest: i32) -> Result<()> {
        let mut ev = epoll_event {
            events: (interest | libc::EPOLLET) as u32,
            u64: token,
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(&mut ev))?;
        Ok(())
    }

    /// Stops watching `fd`. Descriptors the kernel already forgot are fine;
    /// teardown must stay idempotent.
    pub fn unwatch(&self, fd: RawFd) -> Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, None) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other.map_err(HttpError::from),
        }
    }

    /// Blocks for up to `max_wait` and returns the ready batch, which may
    /// be empty. Signal interruptions restart the wait.
    pub fn next_events<'a>(
        &self,
        buf: &'a mut [epoll_event],
        max_wait: Duration,
    ) -> Result<&'a [epoll_event]> {
        let ms = max_wait.as_millis().min(i32::MAX as u128) as c_int;
        loop {
            let ready = cvt(unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    buf.as_mut_ptr(),
                    buf.len() as c_int,
                    ms,
                )
            });
            match ready {
                Ok(n) => return Ok(&buf[..n as usize]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ---- Password databases ----

/// Hash a candidate password with crypt(3) under `setting` as the salt.
/// None when the setting names a hashing scheme the system refuses.
pub fn crypt_hash(key: &str, setting: &str) -> Option<String> {
    let key = CString::new(key).ok()?;
    let setting = CString::new(setting).ok()?;
    unsafe {
        let hashed = ffi::crypt(key.as_ptr(), setting.as_ptr());
        if hashed.is_null() {
            return None;
        }
        Some(CStr::from_ptr(hashed).to_string_lossy().into_owned())
    }
}

/// Stored password hash for a system account: the shadow database when it
/// answers, the passwd database otherwise. Bootstrap-time only; the pointers
/// returned by these calls alias static storage.
pub fn system_password(account: &str) -> Option<String> {
    let name = CString::new(account).ok()?;
    unsafe {
        let sp = libc::getspnam(name.as_ptr());
        if !sp.is_null() && !(*sp).sp_pwdp.is_null() {
            let hash = CStr::from_ptr((*sp).sp_pwdp).to_string_lossy().into_owned();
            if !hash.is_empty() {
                return Some(hash);
            }
        }

        let pw = libc::getpwnam(name.as_ptr());
        if !pw.is_null() && !(*pw).pw_passwd.is_null() {
            let hash = CStr::from_ptr((*pw).pw_passwd).to_string_lossy().into_owned();
            if !hash.is_empty() {
                return Some(hash);
            }
        }
    }
    None
}
