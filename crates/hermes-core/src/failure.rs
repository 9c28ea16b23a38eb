//! Classification of failed exchanges.
//!
//! Every connectivity failure, live or replayed, is turned into an
//! [`ExchangeFailure`] so that the recorded status and the status returned to
//! the client are derived the same way.

use std::fmt;
use std::io;

/// Status recorded for exchanges that timed out.
pub const TIMEOUT_STATUS: u16 = 499;

/// Status recorded for any other failure with a known destination.
pub const FAILURE_STATUS: u16 = 500;

/// Error code for name-resolution failures.
pub const CODE_NOT_FOUND: &str = "ENOTFOUND";

const TIMEOUT_CODES: &[&str] = &["ETIMEDOUT", "ESOCKETTIMEDOUT", "ECONNABORTED", "ETIMEOUT"];

/// A failed upstream exchange: an optional errno-style code plus the
/// verbatim error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeFailure {
    /// Errno-style code such as `ECONNREFUSED`, when known.
    pub code: Option<String>,
    /// Human-readable message, preserved as received.
    pub message: String,
}

impl ExchangeFailure {
    /// Creates a failure with an explicit code.
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// A name-resolution failure for `host`.
    pub fn not_found(host: &str, err: &io::Error) -> Self {
        Self::new(
            Some(CODE_NOT_FOUND),
            format!("getaddrinfo ENOTFOUND {}: {}", host, err),
        )
    }

    /// A timeout raised by the proxy's own timers.
    pub fn timed_out(what: &str) -> Self {
        Self::new(Some("ETIMEDOUT"), format!("{} timed out", what))
    }

    /// Returns true if the failure counts as a timeout.
    pub fn is_timeout(&self) -> bool {
        if let Some(code) = &self.code {
            if TIMEOUT_CODES.contains(&code.as_str()) {
                return true;
            }
        }
        let lower = self.message.to_ascii_lowercase();
        lower.contains("timeout") || lower.contains("timed out")
    }

    /// Status recorded on the entry: `None` for DNS failures, 499 for
    /// timeouts, 500 otherwise.
    pub fn status(&self) -> Option<u16> {
        if self.code.as_deref() == Some(CODE_NOT_FOUND) {
            None
        } else if self.is_timeout() {
            Some(TIMEOUT_STATUS)
        } else {
            Some(FAILURE_STATUS)
        }
    }

    /// Status sent back to the intercepted client.
    pub fn client_status(&self) -> u16 {
        if self.is_timeout() {
            504
        } else {
            502
        }
    }
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExchangeFailure {}

fn io_code(kind: io::ErrorKind) -> Option<&'static str> {
    use io::ErrorKind::*;
    match kind {
        TimedOut => Some("ETIMEDOUT"),
        ConnectionRefused => Some("ECONNREFUSED"),
        ConnectionReset => Some("ECONNRESET"),
        ConnectionAborted => Some("ECONNABORTED"),
        BrokenPipe => Some("EPIPE"),
        AddrNotAvailable => Some("EADDRNOTAVAIL"),
        UnexpectedEof => Some("ECONNRESET"),
        _ => None,
    }
}

impl From<&io::Error> for ExchangeFailure {
    fn from(err: &io::Error) -> Self {
        Self::new(io_code(err.kind()), err.to_string())
    }
}

impl From<io::Error> for ExchangeFailure {
    fn from(err: io::Error) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etimedout_is_499() {
        let failure = ExchangeFailure::new(Some("ETIMEDOUT"), "connect ETIMEDOUT 10.0.0.1:443");
        assert!(failure.is_timeout());
        assert_eq!(failure.status(), Some(499));
        assert_eq!(failure.client_status(), 504);
    }

    #[test]
    fn timeout_detected_from_message() {
        let failure = ExchangeFailure::new(None, "Socket Timeout while reading");
        assert_eq!(failure.status(), Some(499));
        let failure = ExchangeFailure::new(Some("EOTHER"), "operation timed out");
        assert_eq!(failure.status(), Some(499));
    }

    #[test]
    fn connection_reset_is_500() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "read ECONNRESET");
        let failure = ExchangeFailure::from(&err);
        assert_eq!(failure.code.as_deref(), Some("ECONNRESET"));
        assert_eq!(failure.status(), Some(500));
        assert_eq!(failure.client_status(), 502);
        assert_eq!(failure.message, "read ECONNRESET");
    }

    #[test]
    fn io_timeout_maps_to_code() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed");
        let failure = ExchangeFailure::from(err);
        assert_eq!(failure.code.as_deref(), Some("ETIMEDOUT"));
        assert_eq!(failure.status(), Some(499));
    }

    #[test]
    fn dns_failure_has_no_status() {
        let err = io::Error::new(io::ErrorKind::Other, "failed to lookup address information");
        let failure = ExchangeFailure::not_found("nowhere.invalid", &err);
        assert_eq!(failure.status(), None);
        assert_eq!(failure.client_status(), 502);
        assert!(failure.message.contains("nowhere.invalid"));
    }
}
