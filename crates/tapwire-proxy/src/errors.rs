use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("certificate authority error: {0}")]
    Cert(#[from] tapwire_cert::CertError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Substrings of errors that are part of normal connection churn. These log
/// at debug instead of error; the list defines operational log noise and is
/// extended conservatively.
const TRANSIENT_ERROR_MARKERS: [&str; 8] = [
    "connection reset",
    "broken pipe",
    "use of closed",
    "i/o timeout",
    "timed out",
    "handshake timeout",
    "connection refused",
    "unexpected eof",
];

pub(crate) fn is_transient_error_text(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Logs a transport error at debug when it is normal churn, error otherwise.
pub(crate) fn log_transport_error(scope: &'static str, error: &std::io::Error) {
    let message = error.to_string();
    if is_transient_error_text(&message) {
        tracing::debug!(scope, %message, "transport error");
    } else {
        tracing::error!(scope, %message, "transport error");
    }
}

#[cfg(test)]
mod tests {
    use super::is_transient_error_text;

    #[test]
    fn normal_churn_is_transient() {
        for message in [
            "read: connection reset by peer",
            "write: broken pipe",
            "use of closed network connection",
            "i/o timeout",
            "TLS handshake timeout",
            "connect: connection refused",
            "unexpected EOF while reading",
        ] {
            assert!(is_transient_error_text(message), "{message}");
        }
    }

    #[test]
    fn unexpected_errors_are_not_transient() {
        assert!(!is_transient_error_text("certificate signature mismatch"));
        assert!(!is_transient_error_text("address already in use"));
    }
}
