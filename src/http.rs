use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Other,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            _ => Method::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Other => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V09,
    V10,
    V11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"HTTP/0.9" => Some(Version::V09),
            b"HTTP/1.0" => Some(Version::V10),
            b"HTTP/1.1" => Some(Version::V11),
            _ => None,
        }
    }

    /// Status-line prefix. HTTP/0.9 responses have no status line at all;
    /// callers check for `V09` before asking.
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V09 | Version::V10 => "HTTP/1.0",
            Version::V11 => "HTTP/1.1",
        }
    }
}

/// A parsed request. Headers keep their wire order; lookup is by
/// case-insensitive name, first match wins.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// Raw request-URI bytes, exactly as received (still percent-encoded).
    pub uri: Vec<u8>,
    pub headers: Vec<(String, String)>,
    /// Index of the realm that authenticated this request, once auth passes.
    pub realm: Option<usize>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn uri_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.uri)
    }
}
