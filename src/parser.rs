use crate::http::{Method, Request, Version};

pub const MAX_HEADERS: usize = 64;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed before the request can be judged.
    Incomplete,
    InvalidFormat,
    TooLarge,
}

/// Parses an HTTP request out of the given buffer.
/// Returns the parsed Request and the number of bytes consumed up to and
/// including the header terminator.
///
/// Blank lines before the request line are tolerated and skipped. An
/// HTTP/0.9 request is a bare `GET <uri>` line with no version token and no
/// headers.
pub fn parse_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut start = 0;
    while buf[start..].starts_with(b"\r\n") {
        start += 2;
    }

    let line_end = match find_crlf(&buf[start..]) {
        Some(n) => start + n,
        None => return Err(ParseError::Incomplete),
    };
    let line = &buf[start..line_end];

    let mut space1 = 0;
    while space1 < line.len() && line[space1] != b' ' {
        space1 += 1;
    }
    if space1 == 0 || space1 >= line.len() {
        return Err(ParseError::InvalidFormat);
    }
    let method = Method::from_bytes(&line[..space1]);

    let mut space2 = space1 + 1;
    while space2 < line.len() && line[space2] != b' ' {
        space2 += 1;
    }
    let uri = &line[space1 + 1..space2];
    if uri.is_empty() {
        return Err(ParseError::InvalidFormat);
    }

    if space2 >= line.len() {
        // Two tokens only: an HTTP/0.9 simple request. Only GET ever existed
        // in that protocol, and there is no header section to read.
        if method != Method::Get {
            return Err(ParseError::InvalidFormat);
        }
        return Ok((
            Request {
                method,
                version: Version::V09,
                uri: uri.to_vec(),
                headers: Vec::new(),
                realm: None,
            },
            line_end + 2,
        ));
    }

    let version_bytes = &line[space2 + 1..];
    let version = Version::from_bytes(version_bytes).ok_or(ParseError::InvalidFormat)?;
    if version == Version::V09 {
        // "GET / HTTP/0.9" was never valid on the wire.
        return Err(ParseError::InvalidFormat);
    }

    let mut headers = Vec::new();
    let mut cursor = line_end + 2;

    loop {
        let rest = &buf[cursor..];
        if rest.starts_with(b"\r\n") {
            cursor += 2;
            break;
        }
        let hdr_end = match find_crlf(rest) {
            Some(n) => n,
            None => return Err(ParseError::Incomplete),
        };
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooLarge);
        }

        let hdr = &rest[..hdr_end];
        let colon = hdr
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::InvalidFormat)?;
        let name = std::str::from_utf8(&hdr[..colon]).map_err(|_| ParseError::InvalidFormat)?;
        if name.is_empty() {
            return Err(ParseError::InvalidFormat);
        }

        let mut val_start = colon + 1;
        while val_start < hdr.len() && (hdr[val_start] == b' ' || hdr[val_start] == b'\t') {
            val_start += 1;
        }
        let value =
            std::str::from_utf8(&hdr[val_start..]).map_err(|_| ParseError::InvalidFormat)?;

        headers.push((name.to_string(), value.to_string()));
        cursor += hdr_end + 2;
    }

    Ok((
        Request {
            method,
            version,
            uri: uri.to_vec(),
            headers,
            realm: None,
        },
        cursor,
    ))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
