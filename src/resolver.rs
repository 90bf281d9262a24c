//! Request-URI to filesystem path resolution.
//!
//! Turns a raw URL into a physical path while keeping the result jailed
//! under the document root. Unmatched trailing URL components survive as
//! `PathInfo::info` for a downstream dispatcher.

use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use crate::codec;
use crate::config::Config;
use crate::conn::Client;
use crate::error::Result;
use crate::handler;
use crate::http::Version;

pub struct PathInfo {
    /// Resolved physical path.
    pub phys: PathBuf,
    /// URL-visible path relative to the docroot (starts with '/', or empty
    /// for the docroot itself).
    pub name: Vec<u8>,
    /// Residual URL suffix unmatched by the filesystem.
    pub info: Option<Vec<u8>>,
    /// Query string, verbatim.
    pub query: Option<Vec<u8>>,
    /// True when a redirect has already been written to the client.
    pub redirected: bool,
    /// Snapshot of `phys`.
    pub stat: Metadata,
}

impl PathInfo {
    fn new(root_len: usize, canon: Vec<u8>, stat: Metadata) -> Self {
        PathInfo {
            name: canon[root_len..].to_vec(),
            phys: PathBuf::from(OsString::from_vec(canon)),
            info: None,
            query: None,
            redirected: false,
            stat,
        }
    }
}

/// Resolves `url` against the configured document root.
///
/// `Ok(None)` means nothing servable (a 404); a `PathInfo` with
/// `redirected` set means the response went out already.
pub fn resolve(
    cl: &mut Client,
    cfg: &Config,
    url: &[u8],
    version: Version,
) -> Result<Option<PathInfo>> {
    let (path_raw, query) = match url.iter().position(|&b| b == b'?') {
        Some(i) => (&url[..i], Some(url[i + 1..].to_vec())),
        None => (url, None),
    };

    let root = cfg.docroot.as_os_str().as_bytes();
    let mut decoded = Vec::with_capacity(root.len() + path_raw.len());
    decoded.extend_from_slice(root);
    if codec::decode(path_raw, &mut decoded).is_err() {
        return Ok(None);
    }

    // Walk prefixes longest to shortest at '/' boundaries; the first one
    // that exists and is readable wins, and whatever is left over becomes
    // the path-info suffix.
    let mut split = decoded.len();
    let (canon, stat) = loop {
        if let Some(hit) = canonicalize(cfg, &decoded[..split]) {
            break hit;
        }
        match decoded[..split].iter().rposition(|&b| b == b'/') {
            Some(pos) if pos >= root.len() => split = pos,
            _ => return Ok(None),
        }
    };

    // Jail: the canonical result must still be the docroot or inside it.
    if !(canon.starts_with(root) && (canon.len() == root.len() || canon[root.len()] == b'/')) {
        return Ok(None);
    }

    let info = if split < decoded.len() {
        Some(decoded[split..].to_vec())
    } else {
        None
    };

    if stat.is_dir() && info.is_none() {
        if path_raw.last() != Some(&b'/') {
            // Directory requested without its trailing slash.
            let mut location = canon[root.len()..].to_vec();
            location.push(b'/');
            if let Some(q) = &query {
                location.push(b'?');
                location.extend_from_slice(q);
            }
            handler::send_redirect(cl, version, &location)?;
            let mut pi = PathInfo::new(root.len(), canon, stat);
            pi.query = query;
            pi.redirected = true;
            return Ok(Some(pi));
        }

        // Trailing slash present: substitute the first index file found.
        for idx in &cfg.index_files {
            let mut cand = canon.clone();
            cand.push(b'/');
            cand.extend_from_slice(idx.as_bytes());
            if let Ok(s) = fs::metadata(OsStr::from_bytes(&cand)) {
                if s.is_file() && s.mode() & 0o004 != 0 {
                    let mut pi = PathInfo::new(root.len(), cand, s);
                    pi.query = query;
                    return Ok(Some(pi));
                }
            }
        }
    }

    let mut pi = PathInfo::new(root.len(), canon, stat);
    pi.info = info;
    pi.query = query;
    Ok(Some(pi))
}

fn canonicalize(cfg: &Config, path: &[u8]) -> Option<(Vec<u8>, Metadata)> {
    let (canon, stat) = if cfg.no_symlinks {
        // Realpath resolution: symlinks collapse to their targets, so a
        // link pointing out of the docroot fails the jail check later.
        let canon = fs::canonicalize(OsStr::from_bytes(path)).ok()?;
        let stat = fs::metadata(&canon).ok()?;
        (canon.into_os_string().into_vec(), stat)
    } else {
        let canon = canon_lexical(path);
        let stat = fs::metadata(OsStr::from_bytes(&canon)).ok()?;
        (canon, stat)
    };

    if stat.mode() & 0o004 == 0 {
        return None;
    }
    Some((canon, stat))
}

/// Purely lexical canonicalization of an absolute path: collapses duplicate
/// slashes, drops `.` components, and resolves `..` against the segment to
/// its left. Never touches the filesystem.
pub fn canon_lexical(path: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(path.len());
    for seg in path.split(|&b| b == b'/') {
        match seg {
            b"" | b"." => {}
            b".." => {
                while let Some(b) = out.pop() {
                    if b == b'/' {
                        break;
                    }
                }
            }
            s => {
                out.push(b'/');
                out.extend_from_slice(s);
            }
        }
    }
    if out.is_empty() {
        out.push(b'/');
    }
    out
}
