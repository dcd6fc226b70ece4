//! Error classification for the circuit breaker.
//!
//! Only sustained node-side failure should halt ingestion; everything else
//! is logged and swallowed by the caller. Classification is string-based
//! because errors arrive here already flattened through `anyhow` from
//! several transports.

/// What an error means for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection refused/reset, timeout, DNS failure. Escalates.
    Network,
    /// 5xx-equivalent node-side failure. Escalates.
    Server,
    /// Anything else; logged and swallowed, never escalates.
    NonCritical,
}

impl ErrorClass {
    pub fn escalates(&self) -> bool {
        matches!(self, ErrorClass::Network | ErrorClass::Server)
    }
}

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "timed out",
    "timeout",
    "dns error",
    "failed to lookup address",
    "network unreachable",
    "broken pipe",
];

const SERVER_PATTERNS: &[&str] = &[
    "status 500",
    "status 502",
    "status 503",
    "status 504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

pub fn classify_error(error: &anyhow::Error) -> ErrorClass {
    // The chain includes every context layer; match against all of them.
    let message = format!("{:#}", error).to_lowercase();

    if NETWORK_PATTERNS.iter().any(|p| message.contains(p)) {
        ErrorClass::Network
    } else if SERVER_PATTERNS.iter().any(|p| message.contains(p)) {
        ErrorClass::Server
    } else {
        ErrorClass::NonCritical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_escalate() {
        let err = anyhow::anyhow!("request failed: Connection refused (os error 111)");
        assert_eq!(classify_error(&err), ErrorClass::Network);
        assert!(classify_error(&err).escalates());

        let err = anyhow::anyhow!("request timed out after 10s");
        assert_eq!(classify_error(&err), ErrorClass::Network);
    }

    #[test]
    fn server_errors_escalate() {
        let err = anyhow::anyhow!("server returned status 503 Service Unavailable");
        assert_eq!(classify_error(&err), ErrorClass::Server);
    }

    #[test]
    fn context_layers_are_searched() {
        let err = anyhow::anyhow!("dns error: no record found").context("RPC status failed");
        assert_eq!(classify_error(&err), ErrorClass::Network);
    }

    #[test]
    fn other_errors_are_non_critical() {
        let err = anyhow::anyhow!("tx count mismatch at height 42: expected 3, got 2");
        assert_eq!(classify_error(&err), ErrorClass::NonCritical);
        assert!(!classify_error(&err).escalates());
    }
}
