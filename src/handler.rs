//! Request dispatch and response assembly: static files, directory
//! listings, and the error/redirect/challenge emitters.

use std::fmt::Write as _;
use std::fs::{self, File, Metadata};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::time::SystemTime;

use tracing::debug;

use crate::auth::{self, AuthOutcome, AuthRealm};
use crate::codec;
use crate::conditional::{self, Decision};
use crate::config::Config;
use crate::conn::{Client, ConnState};
use crate::error::{HttpError, Result};
use crate::http::{Method, Request, Version};
use crate::io;
use crate::mime;
use crate::resolver::{self, PathInfo};

const STREAM_BUF_BYTES: usize = 4096;

/// The fixed challenge body; its length is load-bearing for clients that
/// read exactly Content-Length bytes.
const AUTH_BODY: &[u8] = b"Authorization Required\n";

/// Entry point: turns the parsed request owned by `cl` into one complete
/// response. Returns the status code served, for the request log.
pub fn serve_request(cl: &mut Client, cfg: &Config, realms: &[AuthRealm]) -> Result<u16> {
    let mut req = cl
        .request
        .take()
        .ok_or(HttpError::Internal("dispatch without a parsed request"))?;

    cl.state = ConnState::Dispatching;

    if req.method == Method::Other {
        let err = HttpError::BadRequest("unrecognized method");
        send_error(cl, Some(req.version), &err)?;
        return Ok(err.status());
    }

    let Some(pi) = resolver::resolve(cl, cfg, &req.uri, req.version)? else {
        send_error(cl, Some(req.version), &HttpError::NotFound)?;
        return Ok(404);
    };
    if pi.redirected {
        return Ok(302);
    }

    match auth::check(&req, realms, &pi.name) {
        AuthOutcome::Denied => {
            send_unauthorized(cl, &req, &cfg.realm)?;
            return Ok(401);
        }
        AuthOutcome::Granted(idx) => req.realm = idx,
    }

    serve_path(cl, cfg, &req, &pi)
}

/// Serves an already-resolved target. Split out of `serve_request` so a
/// downstream dispatcher holding its own `PathInfo` can reuse the static
/// pipeline.
pub fn serve_path(cl: &mut Client, cfg: &Config, req: &Request, pi: &PathInfo) -> Result<u16> {
    cl.state = ConnState::Responding;

    if pi.stat.is_file() {
        serve_file(cl, req, pi)
    } else if pi.stat.is_dir() && pi.info.is_some() {
        // The leftover suffix named something the directory does not have.
        send_error(cl, Some(req.version), &HttpError::NotFound)?;
        Ok(404)
    } else if pi.stat.is_dir() && !cfg.no_dirlists {
        serve_dirlist(cl, req, pi)
    } else {
        send_error(cl, Some(req.version), &HttpError::Forbidden)?;
        Ok(403)
    }
}

fn serve_file(cl: &mut Client, req: &Request, pi: &PathInfo) -> Result<u16> {
    match conditional::evaluate(req, &pi.stat) {
        Decision::NotModified => {
            send_not_modified(cl, req.version, &pi.stat)?;
            return Ok(304);
        }
        Decision::PreconditionFailed => {
            send_precondition_failed(cl, req.version)?;
            return Ok(412);
        }
        Decision::Proceed => {}
    }

    let mut file = match File::open(&pi.phys) {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %pi.phys.display(), error = %e, "open failed after resolve");
            send_error(cl, Some(req.version), &HttpError::Forbidden)?;
            return Ok(403);
        }
    };

    let chunked = req.version == Version::V11 && req.method != Method::Head;

    if req.version != Version::V09 {
        let mut head = status_line(Some(req.version), 200, "OK");
        push_entity_headers(&mut head, &pi.stat);
        let _ = write!(
            head,
            "Content-Type: {}\r\n",
            mime::from_path(pi.phys.as_os_str().as_bytes())
        );
        let _ = write!(head, "Content-Length: {}\r\n", pi.stat.size());
        if chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        head.push_str("\r\n");
        io::send(cl, head.as_bytes())?;
    }

    if req.method != Method::Head {
        let mut buf = [0u8; STREAM_BUF_BYTES];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if chunked {
                io::send_chunk(cl, &buf[..n])?;
            } else {
                io::send(cl, &buf[..n])?;
            }
        }
        if chunked {
            io::send_chunk(cl, b"")?;
        }
    }

    Ok(200)
}

fn serve_dirlist(cl: &mut Client, req: &Request, pi: &PathInfo) -> Result<u16> {
    let read = match fs::read_dir(&pi.phys) {
        Ok(rd) => rd,
        Err(e) => {
            debug!(path = %pi.phys.display(), error = %e, "cannot scan directory");
            send_error(cl, Some(req.version), &HttpError::Forbidden)?;
            return Ok(403);
        }
    };

    let chunked = req.version == Version::V11 && req.method != Method::Head;

    if req.version != Version::V09 {
        let mut head = status_line(Some(req.version), 200, "OK");
        head.push_str("Connection: close\r\n");
        let _ = write!(
            head,
            "Date: {}\r\n",
            httpdate::fmt_http_date(SystemTime::now())
        );
        head.push_str("Content-Type: text/html\r\n");
        if chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        head.push_str("\r\n");
        io::send(cl, head.as_bytes())?;
    }

    if req.method == Method::Head {
        return Ok(200);
    }

    let mut entries: Vec<(Vec<u8>, Metadata)> = Vec::new();
    for entry in read.flatten() {
        let name = entry.file_name().into_encoded_bytes();
        // Follow symlinks so a linked directory lists as a directory.
        if let Ok(stat) = fs::metadata(entry.path()) {
            entries.push((name, stat));
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let title = format!("{}/", String::from_utf8_lossy(&pi.name));
    let mut page = String::new();
    let _ = write!(
        page,
        "<html><head><title>Index of {title}</title></head>\
         <body><h1>Index of {title}</h1><hr /><ol>\n"
    );

    // Directories first. The parent entry is synthesized; the scan itself
    // never yields dot entries.
    if let Ok(stat) = fs::metadata(pi.phys.join("..")) {
        if stat.mode() & 0o001 != 0 {
            dirlist_entry(&mut page, b"..", "../", &stat, None);
        }
    }
    for (name, stat) in &entries {
        if stat.is_dir() && stat.mode() & 0o001 != 0 {
            let href = format!("{}/", codec::encode(name));
            dirlist_entry(&mut page, name, &href, stat, None);
        }
    }

    // Then regular files.
    for (name, stat) in &entries {
        if stat.is_file() && stat.mode() & 0o004 != 0 {
            let href = codec::encode(name);
            dirlist_entry(&mut page, name, &href, stat, Some(mime::from_path(name)));
        }
    }

    let _ = write!(page, "</ol><hr /></body></html>\n");

    io::send_body(cl, req.version, page.as_bytes())?;
    if chunked {
        io::send_body(cl, req.version, b"")?;
    }
    Ok(200)
}

fn dirlist_entry(page: &mut String, name: &[u8], href: &str, stat: &Metadata, mime: Option<&str>) {
    let label = String::from_utf8_lossy(name);
    let date = httpdate::fmt_http_date(conditional::mtime(stat));
    let kind = mime.unwrap_or("directory");
    let kib = stat.size() as f64 / 1024.0;
    let _ = write!(
        page,
        "<li><strong><a href='{href}'>{label}</a></strong><br />\
         <small>modified: {date}<br />{kind} - {kib:.2} kbyte<br /><br /></small></li>\n"
    );
}

/// `302 Found` for a directory requested without its trailing slash. The
/// location bytes pass through as-is.
pub fn send_redirect(cl: &mut Client, version: Version, location: &[u8]) -> Result<()> {
    let mut out = Vec::with_capacity(64 + location.len());
    out.extend_from_slice(status_line(Some(version), 302, "Found").as_bytes());
    out.extend_from_slice(b"Location: ");
    out.extend_from_slice(location);
    out.extend_from_slice(b"\r\nConnection: close\r\n\r\n");
    io::send(cl, &out)
}

fn send_not_modified(cl: &mut Client, version: Version, stat: &Metadata) -> Result<()> {
    let mut head = status_line(Some(version), 304, "Not Modified");
    push_entity_headers(&mut head, stat);
    head.push_str("\r\n");
    io::send(cl, head.as_bytes())
}

/// A failed precondition aborts before any entity header: status,
/// `Connection: close`, and the blank line that closes the header section.
fn send_precondition_failed(cl: &mut Client, version: Version) -> Result<()> {
    let mut head = status_line(Some(version), 412, "Precondition Failed");
    head.push_str("Connection: close\r\n\r\n");
    io::send(cl, head.as_bytes())
}

fn send_unauthorized(cl: &mut Client, req: &Request, realm: &str) -> Result<()> {
    let chunked = req.version == Version::V11 && req.method != Method::Head;

    if req.version != Version::V09 {
        let mut head = status_line(Some(req.version), 401, "Authorization Required");
        head.push_str("Connection: close\r\n");
        let _ = write!(head, "WWW-Authenticate: Basic realm=\"{}\"\r\n", realm);
        let _ = write!(
            head,
            "Date: {}\r\n",
            httpdate::fmt_http_date(SystemTime::now())
        );
        head.push_str("Content-Type: text/plain\r\n");
        let _ = write!(head, "Content-Length: {}\r\n", AUTH_BODY.len());
        if chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        head.push_str("\r\n");
        io::send(cl, head.as_bytes())?;
    }

    if req.method != Method::Head {
        io::send_body(cl, req.version, AUTH_BODY)?;
        if chunked {
            io::send_body(cl, req.version, b"")?;
        }
    }
    Ok(())
}

/// Short plain-text error report. With no request version pinned the body
/// is chunk-framed, since nothing rules out an HTTP/1.1 peer.
pub fn send_error(cl: &mut Client, version: Option<Version>, err: &HttpError) -> Result<()> {
    let code = err.status();
    let reason = err.reason();
    let body = format!("{}\n", reason);
    let framing = version.unwrap_or(Version::V11);
    let chunked = framing == Version::V11;

    if framing != Version::V09 {
        let mut head = status_line(version, code, reason);
        head.push_str("Connection: close\r\n");
        head.push_str("Content-Type: text/plain\r\n");
        let _ = write!(head, "Content-Length: {}\r\n", body.len());
        if chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        head.push_str("\r\n");
        io::send(cl, head.as_bytes())?;
    }

    io::send_body(cl, framing, body.as_bytes())?;
    if chunked {
        io::send_body(cl, framing, b"")?;
    }
    Ok(())
}

fn status_line(version: Option<Version>, code: u16, reason: &str) -> String {
    let proto = match version {
        Some(v) => v.as_str(),
        None => "HTTP/1.1",
    };
    format!("{} {} {}\r\n", proto, code, reason)
}

fn push_entity_headers(head: &mut String, stat: &Metadata) {
    head.push_str("Connection: close\r\n");
    let _ = write!(head, "ETag: {}\r\n", conditional::make_tag(stat));
    let _ = write!(
        head,
        "Last-Modified: {}\r\n",
        httpdate::fmt_http_date(conditional::mtime(stat))
    );
    let _ = write!(
        head,
        "Date: {}\r\n",
        httpdate::fmt_http_date(SystemTime::now())
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::realm_add;
    use crate::testutil::{mem_client, test_config};
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn chmod(path: &Path, mode: u32) {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn docroot() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        File::create(root.join("index.html"))
            .unwrap()
            .write_all(b"<html>home</html>")
            .unwrap();
        chmod(&root.join("index.html"), 0o644);

        File::create(root.join("big.bin"))
            .unwrap()
            .write_all(&[0xA5u8; 10_000])
            .unwrap();
        chmod(&root.join("big.bin"), 0o644);

        fs::create_dir(root.join("secret")).unwrap();
        chmod(&root.join("secret"), 0o755);
        File::create(root.join("secret/key.txt"))
            .unwrap()
            .write_all(b"hush")
            .unwrap();
        chmod(&root.join("secret/key.txt"), 0o644);

        fs::create_dir(root.join("pub")).unwrap();
        chmod(&root.join("pub"), 0o755);
        File::create(root.join("pub/a.txt"))
            .unwrap()
            .write_all(b"a")
            .unwrap();
        chmod(&root.join("pub/a.txt"), 0o644);

        chmod(root, 0o755);
        dir
    }

    fn request(method: Method, version: Version, uri: &[u8], headers: &[(&str, &str)]) -> Request {
        Request {
            method,
            version,
            uri: uri.to_vec(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            realm: None,
        }
    }

    fn run(cfg: &Config, realms: &[AuthRealm], req: Request) -> (u16, Vec<u8>) {
        let (mut cl, sent) = mem_client(vec![], None);
        cl.request = Some(req);
        let status = serve_request(&mut cl, cfg, realms).unwrap();
        let wire = sent.lock().unwrap().clone();
        (status, wire)
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

    /// Reassembles a chunked body and checks the framing while at it.
    fn decode_chunked(mut body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let len_line = std::str::from_utf8(&body[..line_end]).unwrap();
            assert!(!len_line.starts_with('0') || len_line == "0");
            assert!(len_line.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
            let len = usize::from_str_radix(len_line, 16).unwrap();
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
    fn get_file_http11_is_chunked() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Get, Version::V11, b"/index.html", &[]),
        );
        assert_eq!(status, 200);

        let (head, body) = split_response(&wire);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("ETag: \""));
        assert!(head.contains("Last-Modified: "));
        assert!(head.contains("Date: "));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Content-Length: 17\r\n"));
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert_eq!(decode_chunked(&body), b"<html>home</html>");
    }

    #[test]
    fn get_file_http10_is_raw() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Get, Version::V10, b"/index.html", &[]),
        );
        assert_eq!(status, 200);

        let (head, body) = split_response(&wire);
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert_eq!(body, b"<html>home</html>");
    }

    #[test]
    fn head_suppresses_chunking_and_body() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Head, Version::V11, b"/big.bin", &[]),
        );
        assert_eq!(status, 200);

        let (head, body) = split_response(&wire);
        assert!(head.contains("Content-Length: 10000\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(body.is_empty());
    }

    #[test]
    fn simple_09_request_gets_a_bare_body() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Get, Version::V09, b"/index.html", &[]),
        );
        assert_eq!(status, 200);
        assert_eq!(wire, b"<html>home</html>");
    }

    #[test]
    fn not_modified_on_matching_etag() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let stat = fs::metadata(dir.path().join("index.html")).unwrap();
        let tag = conditional::make_tag(&stat);

        let (status, wire) = run(
            &cfg,
            &[],
            request(
                Method::Get,
                Version::V10,
                b"/index.html",
                &[("If-None-Match", tag.as_str())],
            ),
        );
        assert_eq!(status, 304);

        let (head, body) = split_response(&wire);
        assert!(head.starts_with("HTTP/1.0 304 Not Modified\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("ETag: "));
        assert!(body.is_empty());
    }

    #[test]
    fn precondition_failure_is_bare() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(
                Method::Get,
                Version::V11,
                b"/index.html",
                &[("If-Range", "\"x\"")],
            ),
        );
        assert_eq!(status, 412);
        assert_eq!(
            wire,
            b"HTTP/1.1 412 Precondition Failed\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn missing_file_is_404() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Get, Version::V11, b"/../etc/passwd", &[]),
        );
        assert_eq!(status, 404);
        let (head, _) = split_response(&wire);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn missing_file_in_existing_directory_is_404() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, _) = run(
            &cfg,
            &[],
            request(Method::Get, Version::V11, b"/pub/missing.txt", &[]),
        );
        assert_eq!(status, 404);
    }

    #[test]
    fn challenge_without_credentials() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let mut realms = Vec::new();
        assert!(realm_add(&mut realms, "/secret", "alice", "opensesame"));

        let (status, wire) = run(
            &cfg,
            &realms,
            request(Method::Get, Version::V11, b"/secret/key.txt", &[]),
        );
        assert_eq!(status, 401);

        let (head, body) = split_response(&wire);
        assert!(head.starts_with("HTTP/1.1 401 Authorization Required\r\n"));
        assert!(head.contains("WWW-Authenticate: Basic realm=\"Protected Area\"\r\n"));
        assert!(head.contains("Content-Length: 23\r\n"));
        assert_eq!(decode_chunked(&body), b"Authorization Required\n");
    }

    #[test]
    fn good_credentials_reach_the_file() {
        use base64::Engine as _;
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let mut realms = Vec::new();
        assert!(realm_add(&mut realms, "/secret", "alice", "opensesame"));

        let creds = base64::engine::general_purpose::STANDARD.encode("alice:opensesame");
        let auth = format!("Basic {}", creds);
        let (status, wire) = run(
            &cfg,
            &realms,
            request(
                Method::Get,
                Version::V11,
                b"/secret/key.txt",
                &[("Authorization", auth.as_str())],
            ),
        );
        assert_eq!(status, 200);
        let (_, body) = split_response(&wire);
        assert_eq!(decode_chunked(&body), b"hush");
    }

    #[test]
    fn dirlist_renders_both_passes() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(&cfg, &[], request(Method::Get, Version::V11, b"/pub/", &[]));
        assert_eq!(status, 200);

        let (head, body) = split_response(&wire);
        assert!(head.contains("Content-Type: text/html\r\n"));
        let html = String::from_utf8(decode_chunked(&body)).unwrap();
        assert!(html.contains("Index of /pub/"));
        assert!(html.contains("href='../'"));
        assert!(html.contains("a.txt"));
        assert!(html.contains("text/plain"));
        // Directories are listed before files.
        assert!(html.find("../").unwrap() < html.find("a.txt").unwrap());
    }

    #[test]
    fn dirlist_disabled_is_403() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.no_dirlists = true;
        cfg.finalize().unwrap();

        let (status, wire) = run(&cfg, &[], request(Method::Get, Version::V11, b"/pub/", &[]));
        assert_eq!(status, 403);
        let (head, _) = split_response(&wire);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Other, Version::V11, b"/index.html", &[]),
        );
        assert_eq!(status, 400);
        let (head, _) = split_response(&wire);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn post_is_served_like_get() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Post, Version::V11, b"/index.html", &[]),
        );
        assert_eq!(status, 200);
        let (_, body) = split_response(&wire);
        assert_eq!(decode_chunked(&body), b"<html>home</html>");
    }

    #[test]
    fn large_file_streams_in_multiple_chunks() {
        let dir = docroot();
        let mut cfg = test_config(dir.path());
        cfg.finalize().unwrap();

        let (status, wire) = run(
            &cfg,
            &[],
            request(Method::Get, Version::V11, b"/big.bin", &[]),
        );
        assert_eq!(status, 200);
        let (_, body) = split_response(&wire);
        let payload = decode_chunked(&body);
        assert_eq!(payload.len(), 10_000);
        assert!(payload.iter().all(|&b| b == 0xA5));
    }
}
