//! Byte-range HTTP fetch over a blocking facade, with segmented-origin
//! support, ETag/Last-Modified validation, Basic/Digest auth, bounded
//! retry, and mid-transfer cancellation.

pub mod auth;
pub mod error;
mod pool;
mod segment;
mod validate;

pub use auth::AuthConfig;
pub use error::{TransportError, TransportResult};
pub use pool::{ConnectionPool, FetchRequest, FetchResponse};
pub use segment::SegmentSpan;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// A loopback HTTP/1.1 server that replies to any request with one
    /// fixed response, once, then closes. Good enough to drive a single
    /// range GET without a real origin.
    fn serve_one(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/disk.img")
    }

    #[test]
    fn fetch_returns_body_and_validators() {
        let url = serve_one(
            "HTTP/1.1 206 Partial Content\r\n\
             Content-Length: 5\r\n\
             ETag: \"abc\"\r\n\
             Connection: close\r\n\r\n\
             hello",
        );
        let pool = ConnectionPool::new().unwrap();
        let req = FetchRequest {
            url: &url,
            offset: 0,
            length: 5,
            segment_size: None,
            cookies: &[],
            auth: None,
            expected_etag: None,
            expected_last_modified: None,
        };
        let resp = pool.fetch(&req, &|| false).unwrap();
        assert_eq!(resp.data, b"hello");
        assert_eq!(resp.etag.as_deref(), Some("\"abc\""));
    }

    #[test]
    fn fetch_fails_fatally_on_etag_mismatch() {
        let url = serve_one(
            "HTTP/1.1 206 Partial Content\r\n\
             Content-Length: 5\r\n\
             ETag: \"new\"\r\n\
             Connection: close\r\n\r\n\
             hello",
        );
        let pool = ConnectionPool::new().unwrap();
        let req = FetchRequest {
            url: &url,
            offset: 0,
            length: 5,
            segment_size: None,
            cookies: &[],
            auth: None,
            expected_etag: Some("\"old\""),
            expected_last_modified: None,
        };
        let err = pool.fetch(&req, &|| false).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn fetch_honors_cancellation_predicate() {
        let pool = ConnectionPool::new().unwrap();
        let req = FetchRequest {
            url: "http://127.0.0.1:1/disk.img",
            offset: 0,
            length: 5,
            segment_size: None,
            cookies: &[],
            auth: None,
            expected_etag: None,
            expected_last_modified: None,
        };
        let err = pool.fetch(&req, &|| true).unwrap_err();
        assert!(matches!(err, TransportError::Interrupted));
    }
}
