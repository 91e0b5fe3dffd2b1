//! WebSocket close codes used by wsbus.

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// The peer closed without sending a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// The transport went away without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// The connection missed its liveness checks.
pub const CLOSE_TIMED_OUT: u16 = 3008;

/// Reason text sent with [`CLOSE_TIMED_OUT`].
pub const TIMED_OUT_REASON: &str = "Timed out";

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason, possibly empty.
    pub reason: String,
}

impl CloseReason {
    /// Creates a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The transport dropped without a close handshake.
    pub fn abnormal() -> Self {
        Self::new(CLOSE_ABNORMAL, "")
    }

    /// The connection was closed after missing liveness checks.
    pub fn timed_out() -> Self {
        Self::new(CLOSE_TIMED_OUT, TIMED_OUT_REASON)
    }

    /// Returns true if this closure was caused by a liveness timeout.
    pub fn is_timeout(&self) -> bool {
        self.code == CLOSE_TIMED_OUT
    }

    /// Returns true if the transport dropped without a close frame.
    pub fn is_abnormal(&self) -> bool {
        self.code == CLOSE_ABNORMAL
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_is_distinct_from_abnormal() {
        let timeout = CloseReason::timed_out();
        assert!(timeout.is_timeout());
        assert!(!timeout.is_abnormal());

        let abnormal = CloseReason::abnormal();
        assert!(abnormal.is_abnormal());
        assert!(!abnormal.is_timeout());
    }

    #[test]
    fn display_includes_reason() {
        assert_eq!(CloseReason::timed_out().to_string(), "3008 (Timed out)");
        assert_eq!(CloseReason::abnormal().to_string(), "1006");
    }
}
