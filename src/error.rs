use std::io;
use thiserror::Error;

/// Errors that may kill off an HTTP request or connection.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The peer went away, or sent something that tells us it is about to.
    /// The one error that cannot be reported back over the wire.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// An I/O readiness wait exceeded the configured network timeout.
    #[error("network timeout expired")]
    Timeout,

    /// Malformed request line, header block, or percent-encoding.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    /// The request exceeded the header-block byte or count limits.
    #[error("request too large")]
    TooLarge,

    /// The request-URI escaped the document root or named nothing on disk.
    #[error("not found")]
    NotFound,

    /// The target exists but is not servable: wrong file type or permissions.
    #[error("forbidden")]
    Forbidden,

    /// Missing or unverifiable credentials for a protected prefix.
    #[error("authorization required")]
    Unauthorized,

    /// A conditional header failed its test.
    #[error("precondition failed")]
    PreconditionFailed,

    /// A state that should be unreachable; answered with a 500 best-effort.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// Underlying I/O error from the OS.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HttpError {
    /// Status code used when this error is reported to the client.
    /// `ConnectionClosed` and `Timeout` are never reported; they map to a
    /// plain shutdown.
    pub fn status(&self) -> u16 {
        match self {
            HttpError::BadRequest(_) => 400,
            HttpError::Unauthorized => 401,
            HttpError::Forbidden => 403,
            HttpError::NotFound => 404,
            HttpError::PreconditionFailed => 412,
            HttpError::TooLarge => 413,
            _ => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status() {
            400 => "Bad Request",
            401 => "Authorization Required",
            403 => "Forbidden",
            404 => "Not Found",
            412 => "Precondition Failed",
            413 => "Request Entity Too Large",
            _ => "Internal Server Error",
        }
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;
