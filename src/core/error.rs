use thiserror::Error;

/// Core error types for SBS
#[derive(Debug, Error)]
pub enum Error {
    /// Address is not an IPv4, IPv6 or Ethernet literal
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Ticket duration outside the accepted range
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// Unknown config list identifier
    #[error("Invalid list name: {0}")]
    InvalidListName(String),

    /// I/O operation failed (ticket state, config lists, audit log)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Domain lookup failed
    #[error("Failed to resolve {domain}: {message}")]
    Resolution { domain: String, message: String },

    /// The packet filter rejected a single element operation
    #[error("nftables rejected {op} of {element} in set {set}: {message}")]
    FilterApply {
        set: String,
        element: String,
        op: &'static str,
        message: String,
    },

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Config re-processing finished with failed entries
    #[error("Could not process {list}: {}", failures.join("; "))]
    Process { list: String, failures: Vec<String> },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Validation errors are rejected to the caller and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidAddress(_) | Error::InvalidDuration(_) | Error::InvalidListName(_)
        )
    }
}

/// Returns a short operator hint for common nft failure messages.
///
/// Used when logging failed nft invocations so the daemon log says what to
/// check rather than only echoing stderr.
pub fn nftables_hint(msg: &str) -> Option<&'static str> {
    let lower = msg.to_lowercase();

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return Some("sbsd needs CAP_NET_ADMIN (run as root or configure SBS_ELEVATION_METHOD)");
    }
    if lower.contains("cache initialization failed") {
        return Some("insufficient privileges to read the nftables ruleset");
    }
    if lower.contains("no such file") || lower.contains("command not found") {
        return Some("nft is not installed or the configured nft command is wrong");
    }
    if lower.contains("does not exist") {
        return Some("the managed table or set is missing; restart sbsd to recreate it");
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return Some("nft did not answer in time; check system load");
    }
    if lower.contains("netlink") {
        return Some("kernel netlink interface is not responding (is nf_tables loaded?)");
    }
    None
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_flagged() {
        assert!(Error::InvalidAddress("x".into()).is_validation());
        assert!(Error::InvalidDuration("0".into()).is_validation());
        assert!(!Error::Internal("x".into()).is_validation());
    }

    #[test]
    fn test_process_error_lists_failures() {
        let err = Error::Process {
            list: "remote_allowlist_domain".into(),
            failures: vec!["bad.invalid: no records".into(), "x..y: invalid".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("remote_allowlist_domain"));
        assert!(msg.contains("bad.invalid: no records; x..y: invalid"));
    }

    #[test]
    fn test_nftables_hint_permission() {
        let hint = nftables_hint("Error: Operation not permitted").unwrap();
        assert!(hint.contains("CAP_NET_ADMIN"));
    }

    #[test]
    fn test_nftables_hint_missing_set() {
        let hint = nftables_hint("Error: No such file or directory; set allow_ether does not exist");
        assert!(hint.is_some());
    }

    #[test]
    fn test_nftables_hint_unknown() {
        assert!(nftables_hint("something else entirely").is_none());
    }
}
