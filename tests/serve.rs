//! End-to-end pipeline tests: a real server on an ephemeral loopback port,
//! driven over raw TCP.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use postern::{Config, Server};

fn chmod(path: &Path, mode: u32) {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

fn build_docroot() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    File::create(root.join("index.html"))
        .unwrap()
        .write_all(b"<html>home</html>")
        .unwrap();
    chmod(&root.join("index.html"), 0o644);

    File::create(root.join("big.bin"))
        .unwrap()
        .write_all(&vec![0u8; 1_048_576])
        .unwrap();
    chmod(&root.join("big.bin"), 0o644);

    File::create(root.join("data.bin"))
        .unwrap()
        .write_all(&(0..10_000u32).map(|i| i as u8).collect::<Vec<_>>())
        .unwrap();
    chmod(&root.join("data.bin"), 0o644);

    fs::create_dir(root.join("dir")).unwrap();
    chmod(&root.join("dir"), 0o755);
    File::create(root.join("dir/leaf.txt"))
        .unwrap()
        .write_all(b"leaf")
        .unwrap();
    chmod(&root.join("dir/leaf.txt"), 0o644);

    fs::create_dir(root.join("secret")).unwrap();
    chmod(&root.join("secret"), 0o755);
    File::create(root.join("secret/key.txt"))
        .unwrap()
        .write_all(b"hush")
        .unwrap();
    chmod(&root.join("secret/key.txt"), 0o644);

    // A nested path that a %2f escape can reach once decoded.
    fs::create_dir(root.join("a")).unwrap();
    chmod(&root.join("a"), 0o755);
    File::create(root.join("a/b"))
        .unwrap()
        .write_all(b"nested")
        .unwrap();
    chmod(&root.join("a/b"), 0o644);

    chmod(root, 0o755);
    dir
}

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    docroot: tempfile::TempDir,
}

impl TestServer {
    fn start(tweak: impl FnOnce(&mut Config), realms: &[(&str, &str, &str)]) -> Self {
        let docroot = build_docroot();

        let mut cfg = Config::from_env();
        cfg.host = "127.0.0.1".to_string();
        cfg.port = 0;
        cfg.docroot = docroot.path().to_path_buf();
        cfg.realm = "postern-tests".to_string();
        cfg.network_timeout = Duration::from_secs(5);
        cfg.no_symlinks = false;
        cfg.no_dirlists = false;
        tweak(&mut cfg);

        let mut server = Server::new(cfg).unwrap();
        for (path, user, pass) in realms {
            assert!(server.add_realm(path, user, pass));
        }
        let addr = server.bind().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || {
            let _ = server.run();
        });

        TestServer {
            addr,
            shutdown,
            handle: Some(handle),
            docroot,
        }
    }

    /// Writes one raw request and reads until the server closes.
    fn roundtrip(&self, raw: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.write_all(raw).unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        out
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn split_response(wire: &[u8]) -> (String, Vec<u8>) {
    let pos = wire
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    (
        String::from_utf8_lossy(&wire[..pos + 4]).into_owned(),
        wire[pos + 4..].to_vec(),
    )
}

fn decode_chunked(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
        let len = usize::from_str_radix(std::str::from_utf8(&body[..line_end]).unwrap(), 16).unwrap();
        body = &body[line_end + 2..];
        if len == 0 {
            assert_eq!(body, b"\r\n");
            return out;
        }
        out.extend_from_slice(&body[..len]);
        assert_eq!(&body[len..len + 2], b"\r\n");
        body = &body[len + 2..];
    }
}

#[test]
fn static_pipeline_over_tcp() {
    let srv = TestServer::start(|_| {}, &[]);

    // Traversal attempts never leave the docroot.
    let wire = srv.roundtrip(b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
    assert!(wire.starts_with(b"HTTP/1.1 404"));

    // A directory without its trailing slash redirects.
    let wire = srv.roundtrip(b"GET /dir HTTP/1.1\r\n\r\n");
    let (head, _) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(head.contains("Location: /dir/\r\n"));
    assert!(head.contains("Connection: close\r\n"));

    // Plain file over HTTP/1.1: chunked, and the payload survives framing.
    let wire = srv.roundtrip(b"GET /data.bin HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(head.contains("Content-Length: 10000\r\n"));
    let payload = decode_chunked(&body);
    assert_eq!(payload.len(), 10_000);
    assert_eq!(payload[255], 255);

    // Same file over HTTP/1.0: raw body, no chunking.
    let wire = srv.roundtrip(b"GET /data.bin HTTP/1.0\r\n\r\n");
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(!head.contains("Transfer-Encoding"));
    assert_eq!(body.len(), 10_000);

    // HEAD on a large file advertises the length but chunks nothing.
    let wire = srv.roundtrip(b"HEAD /big.bin HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 1048576\r\n"));
    assert!(!head.contains("Transfer-Encoding"));
    assert!(body.is_empty());

    // An encoded slash is a real slash after decoding.
    let wire = srv.roundtrip(b"GET /a%2fb HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(decode_chunked(&body), b"nested");

    // Malformed percent escapes resolve to nothing.
    let wire = srv.roundtrip(b"GET /a%2 HTTP/1.1\r\n\r\n");
    assert!(wire.starts_with(b"HTTP/1.1 404"));
}

#[test]
fn conditional_requests_over_tcp() {
    let srv = TestServer::start(|_| {}, &[]);

    let stat = fs::metadata(srv.docroot.path().join("index.html")).unwrap();
    let tag = postern::conditional::make_tag(&stat);

    // Scenario: HTTP/1.0 client revalidates with the current tag.
    let req = format!("GET /index.html HTTP/1.0\r\nIf-None-Match: {}\r\n\r\n", tag);
    let wire = srv.roundtrip(req.as_bytes());
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.0 304 Not Modified\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert!(head.contains(&format!("ETag: {}\r\n", tag)));
    assert!(body.is_empty());

    // A stale tag is served normally.
    let wire = srv.roundtrip(
        b"GET /index.html HTTP/1.1\r\nIf-None-Match: \"0-0-0\"\r\n\r\n",
    );
    assert!(wire.starts_with(b"HTTP/1.1 200 OK"));

    // Range probes are refused outright.
    let req = format!("GET /index.html HTTP/1.1\r\nIf-Range: {}\r\n\r\n", tag);
    let wire = srv.roundtrip(req.as_bytes());
    assert_eq!(
        wire,
        b"HTTP/1.1 412 Precondition Failed\r\nConnection: close\r\n\r\n"
    );
}

#[test]
fn auth_over_tcp() {
    use base64::Engine as _;

    let srv = TestServer::start(|_| {}, &[("/secret", "alice", "opensesame")]);

    // No credentials: challenged, with the fixed 23-byte body.
    let wire = srv.roundtrip(b"GET /secret/ HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.1 401 Authorization Required\r\n"));
    assert!(head.contains("WWW-Authenticate: Basic realm=\"postern-tests\"\r\n"));
    let payload = decode_chunked(&body);
    assert_eq!(payload, b"Authorization Required\n");
    assert_eq!(payload.len(), 23);

    // Wrong password: challenged again.
    let bad = base64::engine::general_purpose::STANDARD.encode("alice:nope");
    let req = format!("GET /secret/key.txt HTTP/1.1\r\nAuthorization: Basic {}\r\n\r\n", bad);
    let wire = srv.roundtrip(req.as_bytes());
    assert!(wire.starts_with(b"HTTP/1.1 401"));

    // Valid credentials reach the file.
    let good = base64::engine::general_purpose::STANDARD.encode("alice:opensesame");
    let req = format!(
        "GET /secret/key.txt HTTP/1.1\r\nAuthorization: Basic {}\r\n\r\n",
        good
    );
    let wire = srv.roundtrip(req.as_bytes());
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(decode_chunked(&body), b"hush");

    // Paths outside the realm stay public.
    let wire = srv.roundtrip(b"GET /index.html HTTP/1.1\r\n\r\n");
    assert!(wire.starts_with(b"HTTP/1.1 200 OK"));
}

#[test]
fn dirlists_over_tcp() {
    let srv = TestServer::start(|_| {}, &[]);

    let wire = srv.roundtrip(b"GET /dir/ HTTP/1.1\r\n\r\n");
    let (head, body) = split_response(&wire);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: text/html\r\n"));
    let html = String::from_utf8(decode_chunked(&body)).unwrap();
    assert!(html.contains("Index of /dir/"));
    assert!(html.contains("leaf.txt"));

    let srv = TestServer::start(|cfg| cfg.no_dirlists = true, &[]);
    let wire = srv.roundtrip(b"GET /dir/ HTTP/1.1\r\n\r\n");
    assert!(wire.starts_with(b"HTTP/1.1 403 Forbidden"));
}

#[test]
fn protocol_errors_over_tcp() {
    let srv = TestServer::start(|_| {}, &[]);

    // Garbage request line.
    let wire = srv.roundtrip(b"COMPLETE NONSENSE\r\n\r\n");
    assert!(wire.starts_with(b"HTTP/1.1 400"));

    // Unsupported protocol version.
    let wire = srv.roundtrip(b"GET / HTTP/3.0\r\n\r\n");
    assert!(wire.starts_with(b"HTTP/1.1 400"));

    // Too many headers.
    let mut big = String::from("GET /index.html HTTP/1.1\r\n");
    for i in 0..70 {
        big.push_str(&format!("H{}: v\r\n", i));
    }
    big.push_str("\r\n");
    let wire = srv.roundtrip(big.as_bytes());
    assert!(wire.starts_with(b"HTTP/1.1 413"));
}
