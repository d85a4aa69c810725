use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use tracing::debug;

use crate::bytes::ByteCounters;
use crate::errors::ErrContext;

/// Wall-clock timeout for control-plane requests (bouncer, collector,
/// public-IP lookup), covering DNS, connect, TLS, and the full body.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Allowance for the request headers the transport adds on the wire
/// (Host, Accept, Content-Length, keep-alive negotiation). The transport
/// does not expose the final header block, so uploads are estimated.
const REQUEST_HEADER_ESTIMATE: u64 = 128;

/// HTTP client facade.
///
/// Wraps a single connection-pooling client; per-request timeouts are
/// supplied by the caller. Every call credits an on-wire byte estimate to
/// the session counters, counting each byte once. TLS record overhead is
/// not observable through the transport and is excluded, so the counters
/// are a lower-bound estimate of the traffic actually exchanged.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Build a client, loading the PEM bundle at `ca_bundle_path` as an
    /// additional trust root when the path is non-empty.
    pub fn new(ca_bundle_path: &str) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();

        if !ca_bundle_path.is_empty() {
            let pem = std::fs::read(ca_bundle_path)
                .with_context(|| format!("reading CA bundle {ca_bundle_path}"))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("parsing CA bundle {ca_bundle_path}"))?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            client: builder.build().context("building HTTP client")?,
        })
    }

    /// Client with default trust roots only.
    pub fn plain() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// `GET url`, returning the response body.
    pub async fn get(
        &self,
        url: &str,
        timeout: Duration,
        counters: &ByteCounters,
    ) -> Result<String, ErrContext> {
        self.perform(Method::GET, url, None, timeout, counters).await
    }

    /// `POST url` with a JSON body, returning the response body.
    pub async fn post_json(
        &self,
        url: &str,
        body: String,
        timeout: Duration,
        counters: &ByteCounters,
    ) -> Result<String, ErrContext> {
        self.perform(Method::POST, url, Some(body), timeout, counters)
            .await
    }

    async fn perform(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
        timeout: Duration,
        counters: &ByteCounters,
    ) -> Result<String, ErrContext> {
        debug!(%method, url, "http request");

        let body_len = body.as_ref().map_or(0, String::len);
        counters.add_up(request_bytes_estimate(&method, url, body_len));

        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ErrContext::transport(transport_code(&e), e.to_string()))?;

        let status = response.status();
        counters.add_down(response_bytes_estimate(status, response.headers()));

        let text = response
            .text()
            .await
            .map_err(|e| ErrContext::transport(transport_code(&e), e.to_string()))?;
        counters.add_down(text.len() as u64);

        if status.as_u16() >= 400 {
            debug!(%status, url, "http request failed");
            return Err(ErrContext::transport(
                i64::from(status.as_u16()),
                format!("unexpected status {status}"),
            ));
        }

        Ok(text)
    }
}

/// Strip trailing slashes so fixed suffixes can be appended to base URLs.
pub(crate) fn trim_trailing_slashes(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn transport_code(err: &reqwest::Error) -> i64 {
    err.status().map_or(1, |s| i64::from(s.as_u16()))
}

/// Request line plus header allowance plus body.
fn request_bytes_estimate(method: &Method, url: &str, body_len: usize) -> u64 {
    // "<METHOD> <url> HTTP/1.1\r\n" plus the header allowance.
    method.as_str().len() as u64
        + url.len() as u64
        + 12
        + REQUEST_HEADER_ESTIMATE
        + body_len as u64
}

/// Status line plus the observed response headers; the body is credited
/// separately once received.
fn response_bytes_estimate(status: StatusCode, headers: &HeaderMap) -> u64 {
    let mut total = 11 + status.as_str().len() as u64
        + status.canonical_reason().map_or(0, |r| r.len() as u64);
    for (name, value) in headers {
        total += name.as_str().len() as u64 + value.as_bytes().len() as u64 + 4;
    }
    total + 2
}
