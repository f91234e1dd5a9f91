use std::fmt;

use crate::status_code::{self, status_code_t, StatusCode};

/// A status value carrying a code and optional message.
///
/// The `#[must_use]` attribute ensures callers do not silently ignore
/// error statuses.
#[derive(Debug, Clone)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
}

impl Status {
    /// Create a status with just a code.
    pub fn new(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create a status with a code and a descriptive message.
    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
        }
    }

    /// Return the numeric status code.
    pub fn code(&self) -> status_code_t {
        self.code
    }

    /// Return the optional message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this status represents success (code == OK).
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Whether the status belongs to the transient I/O family.
    pub fn is_transient(&self) -> bool {
        crate::status_code::ChunkCode::is_transient(self.code)
    }

    /// Produce a human-readable description like `"Chunk::NoSpace(4012) dir full"`.
    pub fn describe(&self) -> String {
        let name = status_code::to_string(self.code);
        match &self.message {
            Some(msg) => format!("{}({}) {}", name, self.code, msg),
            None => format!("{}({})", name, self.code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self::new(code)
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        let code = err
            .raw_os_error()
            .map(status_code::from_errno)
            .unwrap_or(StatusCode::IO_ERROR);
        Self::with_message(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::ChunkCode;

    #[test]
    fn test_status_ok() {
        let s = Status::new(StatusCode::OK);
        assert!(s.is_ok());
        assert_eq!(s.code(), 0);
        assert!(s.message().is_none());
        assert_eq!(s.describe(), "OK(0)");
    }

    #[test]
    fn test_status_with_message() {
        let s = Status::with_message(ChunkCode::NO_SUCH_CHUNK, "no such chunk");
        assert!(!s.is_ok());
        assert_eq!(s.code(), 4000);
        assert_eq!(s.message(), Some("no such chunk"));
        assert_eq!(s.describe(), "Chunk::NoSuchChunk(4000) no such chunk");
    }

    #[test]
    fn test_status_display() {
        let s = Status::new(ChunkCode::IO_TIMED_OUT);
        assert_eq!(format!("{}", s), "Chunk::IOTimedOut(4008)");
    }

    #[test]
    fn test_status_from_code() {
        let s: Status = StatusCode::INVALID_ARG.into();
        assert_eq!(s.code(), 3);
    }

    #[test]
    fn test_status_from_io_error() {
        let e = std::io::Error::from_raw_os_error(libc::ETIMEDOUT);
        let s: Status = e.into();
        assert_eq!(s.code(), ChunkCode::IO_TIMED_OUT);
        assert!(s.is_transient());
    }

    #[test]
    fn test_status_is_error() {
        let s = Status::new(StatusCode::UNKNOWN);
        let e: &dyn std::error::Error = &s;
        assert!(e.to_string().contains("Unknown"));
    }
}
