//! HTTP-shaped error classification (spec §4.4.3, SPEC_FULL C.4) as a pure
//! function over a status code, independent of any particular HTTP client.

use crate::error::HandlerError;

/// Classify an HTTP status code per spec §4.4.3's table, producing the
/// classified [`HandlerError`] a handler implementation can return.
pub fn classify_http_status(
    status: u16,
    message: impl Into<String>,
    retry_after: Option<i64>,
) -> HandlerError {
    HandlerError::from_http_status(status, message, retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable_with_hint() {
        let err = classify_http_status(429, "rate limited", Some(30));
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_is_permanent() {
        let err = classify_http_status(404, "missing", None);
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_error_is_retryable_without_forced_backoff() {
        let err = classify_http_status(502, "bad gateway", None);
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            HandlerError::Retryable { retry_after_seconds: None, .. }
        ));
    }
}
