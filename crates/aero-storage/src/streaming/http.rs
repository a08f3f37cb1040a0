//! Thin HTTP client used by the streaming disks.
//!
//! Wraps a hyper client with the request shaping the disks need (HEAD probe,
//! single-range GET with optional `If-Range`, bounded body collection) and
//! keeps URL query strings out of every error message, since signed URLs
//! carry bearer-equivalent tokens in the query.

use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{
    HeaderValue, ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_RANGE,
    LAST_MODIFIED, RANGE,
};
use hyper::{Body, Method, Request, StatusCode};
use url::Url;

use super::StreamingDiskError;

type HttpsClient = hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// URL rendered without its query or fragment, safe for logs and errors.
pub(crate) fn redacted(url: &Url) -> String {
    let mut safe = url.clone();
    safe.set_query(None);
    safe.set_fragment(None);
    safe.to_string()
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub content_encoding: Option<String>,
    pub accept_ranges_bytes: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

pub(crate) struct HttpResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

#[derive(Clone)]
pub(crate) struct HttpClient {
    client: HttpsClient,
    request_headers: Vec<(String, String)>,
}

impl HttpClient {
    pub fn new(request_headers: Vec<(String, String)>) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            client: hyper::Client::builder().build(connector),
            request_headers,
        }
    }

    fn build_request(
        &self,
        method: Method,
        url: &Url,
        range: Option<(u64, u64)>,
        if_range: Option<&str>,
    ) -> Result<Request<Body>, StreamingDiskError> {
        let uri: hyper::Uri = url
            .as_str()
            .parse()
            .map_err(|_| StreamingDiskError::Protocol("invalid request url".to_string()))?;

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &self.request_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((start, end_inclusive)) = range {
            builder = builder.header(RANGE, format!("bytes={start}-{end_inclusive}"));
        }
        if let Some(validator) = if_range {
            builder = builder.header(IF_RANGE, validator);
        }
        builder
            .body(Body::empty())
            .map_err(|err| StreamingDiskError::Protocol(format!("invalid request: {err}")))
    }

    async fn dispatch(
        &self,
        request: Request<Body>,
        url: &Url,
        max_body: u64,
    ) -> Result<HttpResponse, StreamingDiskError> {
        // A HEAD response declares the full representation length but carries
        // no body, so the declared length must not be held against the cap.
        let is_head = request.method() == Method::HEAD;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| StreamingDiskError::Http(format!("{err} ({})", redacted(url))))?;

        let head = ResponseHead {
            status: response.status(),
            content_length: header_str(response.headers().get(CONTENT_LENGTH))
                .and_then(|v| v.parse().ok()),
            content_range: header_str(response.headers().get(CONTENT_RANGE)),
            content_encoding: header_str(response.headers().get(CONTENT_ENCODING)),
            accept_ranges_bytes: header_str(response.headers().get(ACCEPT_RANGES))
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            etag: header_str(response.headers().get(ETAG)),
            last_modified: header_str(response.headers().get(LAST_MODIFIED)),
        };

        // Bodies past the cap are not collected. The head still reaches the
        // caller, who classifies by status first (e.g. a 200 full-file answer
        // to an If-Range request is a validator mismatch, however large).
        let oversized = !is_head
            && head
                .content_length
                .map(|declared| declared > max_body)
                .unwrap_or(false);
        if oversized {
            return Ok(HttpResponse {
                head,
                body: Bytes::new(),
            });
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| StreamingDiskError::Http(format!("{err} ({})", redacted(url))))?;
        if body.len() as u64 > max_body {
            return Err(StreamingDiskError::Protocol(format!(
                "response body of {} bytes exceeds the {max_body} byte limit",
                body.len()
            )));
        }

        Ok(HttpResponse { head, body })
    }

    pub async fn head(&self, url: &Url) -> Result<ResponseHead, StreamingDiskError> {
        let request = self.build_request(Method::HEAD, url, None, None)?;
        Ok(self.dispatch(request, url, 0).await?.head)
    }

    /// Single-range GET. `range` is `(start, end_inclusive)`.
    pub async fn get_range(
        &self,
        url: &Url,
        range: (u64, u64),
        if_range: Option<&str>,
        max_body: u64,
    ) -> Result<HttpResponse, StreamingDiskError> {
        let request = self.build_request(Method::GET, url, Some(range), if_range)?;
        self.dispatch(request, url, max_body).await
    }

    pub async fn get(&self, url: &Url, max_body: u64) -> Result<HttpResponse, StreamingDiskError> {
        let request = self.build_request(Method::GET, url, None, None)?;
        self.dispatch(request, url, max_body).await
    }
}

fn header_str(value: Option<&HeaderValue>) -> Option<String> {
    value.and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

/// Parses a `Content-Range: bytes start-end/total` header. Returns
/// `(start, end_inclusive, total)`; `total` is `None` for `*`.
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        text => {
            let total: u64 = text.parse().ok()?;
            if total <= end {
                return None;
            }
            Some(total)
        }
    };
    Some((start, end, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parses_plain_and_star_totals() {
        assert_eq!(parse_content_range("bytes 0-1023/4096"), Some((0, 1023, Some(4096))));
        assert_eq!(parse_content_range("bytes 512-1023/*"), Some((512, 1023, None)));
        assert_eq!(
            parse_content_range("bytes 4294967296-4294968319/4294968320"),
            Some((4_294_967_296, 4_294_968_319, Some(4_294_968_320)))
        );
    }

    #[test]
    fn content_range_rejects_malformed_values() {
        assert_eq!(parse_content_range("bytes 10-5/100"), None);
        assert_eq!(parse_content_range("bytes 0-99/50"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes */100"), None);
    }

    #[test]
    fn redacted_strips_query_and_fragment() {
        let url = Url::parse("https://img.example/disk.img?token=secret#frag").unwrap();
        assert_eq!(redacted(&url), "https://img.example/disk.img");
    }
}
