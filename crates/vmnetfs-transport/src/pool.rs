//! Blocking fetch facade over a private multi-threaded Tokio runtime.
//!
//! The engine above this crate runs on plain OS threads and blocks for the
//! duration of one fetch, matching a single `curl_easy_perform` call in
//! the reference engine. [`ConnectionPool`] owns one runtime per image and
//! bridges each blocking call into it via `Handle::block_on`; the worker
//! threads inside that runtime are an implementation detail of the HTTP
//! stack, not part of the engine's documented concurrency model.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::auth::{basic_header, digest_header, AuthConfig, DigestChallenge};
use crate::error::{TransportError, TransportResult};
use crate::segment::{self, SegmentSpan};
use crate::validate;

const TRANSPORT_TRIES: u32 = 5;
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type HttpsClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// One byte-range fetch against a (possibly segmented) origin.
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub offset: u64,
    pub length: u64,
    pub segment_size: Option<u64>,
    pub cookies: &'a [String],
    pub auth: Option<&'a AuthConfig>,
    pub expected_etag: Option<&'a str>,
    pub expected_last_modified: Option<i64>,
}

/// The fetched bytes plus whatever validators the origin reported, so the
/// caller can remember them for the image's next fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub data: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
}

pub struct ConnectionPool {
    runtime: tokio::runtime::Runtime,
    client: HttpsClient,
}

impl ConnectionPool {
    pub fn new() -> TransportResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| TransportError::Fatal(format!("failed to start transport runtime: {e}")))?;

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self { runtime, client })
    }

    /// Fetch `req`, retrying network errors up to `TRANSPORT_TRIES` times.
    /// Fatal errors and cancellation are returned immediately.
    pub fn fetch(
        &self,
        req: &FetchRequest<'_>,
        should_abort: &dyn Fn() -> bool,
    ) -> TransportResult<FetchResponse> {
        let mut last_err = None;
        for attempt in 1..=TRANSPORT_TRIES {
            if should_abort() {
                return Err(TransportError::Interrupted);
            }
            match self.fetch_stream_once(req, should_abort) {
                Ok(resp) => return Ok(resp),
                Err(TransportError::Interrupted) => return Err(TransportError::Interrupted),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, url = req.url, error = %e, "chunk fetch failed, retrying");
                    last_err = Some(e);
                    if attempt < TRANSPORT_TRIES {
                        std::thread::sleep(TRANSPORT_RETRY_DELAY);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TransportError::Network("exhausted retries".into())))
    }

    /// Fetch `req` exactly once, with no retry. Used for the retry loop's
    /// single attempt and for streaming callers that manage their own
    /// retry policy.
    pub fn fetch_stream_once(
        &self,
        req: &FetchRequest<'_>,
        should_abort: &dyn Fn() -> bool,
    ) -> TransportResult<FetchResponse> {
        self.runtime
            .handle()
            .block_on(self.fetch_async(req, should_abort))
    }

    async fn fetch_async(
        &self,
        req: &FetchRequest<'_>,
        should_abort: &dyn Fn() -> bool,
    ) -> TransportResult<FetchResponse> {
        let segmented = req.segment_size.is_some();
        let spans = segment::plan(req.offset, req.length, req.segment_size);
        let mut data = Vec::with_capacity(req.length as usize);
        let mut etag = None;
        let mut last_modified = None;

        for (i, span) in spans.iter().enumerate() {
            if should_abort() {
                return Err(TransportError::Interrupted);
            }
            let url = segment::segment_url(req.url, span.index, segmented);
            let chunk = self.fetch_span(&url, span, req, should_abort).await?;
            if i == 0 {
                etag = chunk.etag;
                last_modified = chunk.last_modified;
            }
            data.extend_from_slice(&chunk.data);
        }

        Ok(FetchResponse {
            data,
            etag,
            last_modified,
        })
    }

    async fn fetch_span(
        &self,
        url: &str,
        span: &SegmentSpan,
        req: &FetchRequest<'_>,
        should_abort: &dyn Fn() -> bool,
    ) -> TransportResult<FetchResponse> {
        let response = self.send_ranged_get(url, span, req, None).await?;

        if response.status() == http::StatusCode::UNAUTHORIZED {
            if let Some(AuthConfig::Digest { username, password }) = req.auth {
                let challenge = response
                    .headers()
                    .get(http::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(DigestChallenge::parse)
                    .ok_or_else(|| TransportError::Fatal("no digest challenge offered".into()))?;
                let header = digest_header(&challenge, "GET", url, username, password);
                let response = self.send_ranged_get(url, span, req, Some(header)).await?;
                return self.read_validated_body(response, req, should_abort).await;
            }
            return Err(TransportError::Fatal("authentication rejected".into()));
        }

        self.read_validated_body(response, req, should_abort).await
    }

    async fn send_ranged_get(
        &self,
        url: &str,
        span: &SegmentSpan,
        req: &FetchRequest<'_>,
        digest_auth_header: Option<String>,
    ) -> TransportResult<hyper::Response<hyper::body::Incoming>> {
        let uri: http::Uri = url
            .parse()
            .map_err(|e| TransportError::Fatal(format!("invalid url {url}: {e}")))?;

        let mut builder = http::Request::builder()
            .method("GET")
            .uri(uri)
            .header(
                http::header::RANGE,
                format!(
                    "bytes={}-{}",
                    span.local_offset,
                    span.local_offset + span.local_length - 1
                ),
            )
            .header(
                http::header::USER_AGENT,
                format!("vmnetfs-core/{}", env!("CARGO_PKG_VERSION")),
            );

        if !req.cookies.is_empty() {
            builder = builder.header(http::header::COOKIE, req.cookies.join("; "));
        }

        if let Some(header) = digest_auth_header {
            builder = builder.header(http::header::AUTHORIZATION, header);
        } else if let Some(AuthConfig::Basic { username, password }) = req.auth {
            builder = builder.header(
                http::header::AUTHORIZATION,
                basic_header(username, password),
            );
        }

        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| TransportError::Fatal(e.to_string()))?;

        tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| TransportError::Network("request timed out".into()))?
            .map_err(|e| TransportError::Network(e.to_string()))
    }

    async fn read_validated_body(
        &self,
        response: hyper::Response<hyper::body::Incoming>,
        req: &FetchRequest<'_>,
        should_abort: &dyn Fn() -> bool,
    ) -> TransportResult<FetchResponse> {
        if !response.status().is_success() {
            return Err(TransportError::Fatal(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let response_etag = response
            .headers()
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let response_last_modified = response
            .headers()
            .get(http::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(validate::parse_last_modified);

        validate::check(
            req.expected_etag,
            req.expected_last_modified,
            response_etag.as_deref(),
            response_last_modified,
        )?;

        let mut body = response.into_body();
        let mut data = Vec::new();
        loop {
            if should_abort() {
                return Err(TransportError::Interrupted);
            }
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(chunk) = frame.data_ref() {
                        data.extend_from_slice(chunk);
                    }
                }
                Some(Err(e)) => return Err(TransportError::Network(e.to_string())),
                None => break,
            }
        }

        Ok(FetchResponse {
            data,
            etag: response_etag,
            last_modified: response_last_modified,
        })
    }
}
