//! Conditional-request evaluation (RFC 2616 §14) and entity tags.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::http::{Method, Request};

/// What the precondition headers decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    NotModified,
    PreconditionFailed,
}

/// Weak entity tag derived from the stat snapshot:
/// `"<hex-inode>-<hex-size>-<hex-mtime>"`.
pub fn make_tag(stat: &Metadata) -> String {
    format!("\"{:x}-{:x}-{:x}\"", stat.ino(), stat.size(), stat.mtime())
}

/// Modification time at whole-second precision, the granularity HTTP dates
/// can express.
pub fn mtime(stat: &Metadata) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(stat.mtime().max(0) as u64)
}

/// Evaluates the conditional headers in their fixed order, stopping at the
/// first failure.
///
/// The order deliberately checks `If-Modified-Since` ahead of `If-Match`
/// (inverting the RFC's advice), and the mere presence of `If-Range` fails
/// the request because ranges are unsupported; both reproduce the deployed
/// behavior this server is compatible with.
pub fn evaluate(req: &Request, stat: &Metadata) -> Decision {
    let tag = make_tag(stat);
    let modified = mtime(stat);

    if let Some(since) = date_header(req, "If-Modified-Since") {
        if since >= modified {
            return Decision::NotModified;
        }
    }

    if let Some(list) = req.header("If-Match") {
        if !token_match(list, &tag) {
            return Decision::PreconditionFailed;
        }
    }

    if req.header("If-Range").is_some() {
        return Decision::PreconditionFailed;
    }

    if let Some(since) = date_header(req, "If-Unmodified-Since") {
        if since <= modified {
            return Decision::PreconditionFailed;
        }
    }

    if let Some(list) = req.header("If-None-Match") {
        if token_match(list, &tag) {
            return match req.method {
                Method::Get | Method::Head => Decision::NotModified,
                _ => Decision::PreconditionFailed,
            };
        }
    }

    Decision::Proceed
}

fn date_header(req: &Request, name: &str) -> Option<SystemTime> {
    // Unparseable dates are ignored, not failed.
    httpdate::parse_http_date(req.header(name)?).ok()
}

/// Entity-tag lists split on commas and spaces; `*` matches anything.
fn token_match(list: &str, tag: &str) -> bool {
    list.split([',', ' '])
        .filter(|t| !t.is_empty())
        .any(|t| t == "*" || t == tag)
}
