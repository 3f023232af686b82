//! Validator checking: an origin must not have changed out from under a
//! cached chunk. Mirrors `check_validators` in the reference engine.

use crate::error::TransportError;

/// Compare the validators an `Image` was opened with against the ones a
/// fetch's response carried. An image that expects an ETag requires the
/// response to carry one at all, since a server that stops sending ETags
/// is as suspect as one sending a different one. Last-Modified has no such
/// presence requirement: only a value that actually differs is an error.
pub fn check(
    expected_etag: Option<&str>,
    expected_last_modified: Option<i64>,
    response_etag: Option<&str>,
    response_last_modified: Option<i64>,
) -> Result<(), TransportError> {
    if let Some(expected) = expected_etag {
        match response_etag {
            None => {
                return Err(TransportError::Fatal("missing ETag".into()));
            }
            Some(actual) if actual != expected => {
                return Err(TransportError::Fatal(format!(
                    "ETag mismatch: expected {expected}, got {actual}"
                )));
            }
            Some(_) => {}
        }
    }
    if let (Some(expected), Some(actual)) = (expected_last_modified, response_last_modified) {
        if expected != actual {
            return Err(TransportError::Fatal(format!(
                "Last-Modified mismatch: expected {expected}, got {actual}"
            )));
        }
    }
    Ok(())
}

/// Parse an HTTP-date `Last-Modified` header value into a Unix timestamp.
pub fn parse_last_modified(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_etag_passes() {
        assert!(check(Some("abc"), None, Some("abc"), None).is_ok());
    }

    #[test]
    fn mismatched_etag_is_fatal() {
        let err = check(Some("abc"), None, Some("def"), None).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_expected_validator_is_not_checked() {
        assert!(check(None, None, Some("anything"), None).is_ok());
    }

    #[test]
    fn response_missing_expected_etag_is_fatal() {
        let err = check(Some("abc"), None, None, None).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn response_missing_last_modified_when_expected_is_not_checked() {
        assert!(check(None, Some(1000), None, None).is_ok());
    }

    #[test]
    fn mismatched_last_modified_is_fatal() {
        let err = check(None, Some(1000), None, Some(2000)).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn parses_rfc2822_http_date() {
        let ts = parse_last_modified("Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert_eq!(ts, 784887151);
    }

    #[test]
    fn rejects_unparseable_date() {
        assert!(parse_last_modified("not a date").is_none());
    }
}
