use tracing::debug;

use crate::bytes::ByteCounters;
use crate::errors::ErrContext;
use crate::net::{HttpClient, CONTROL_TIMEOUT};

/// Well-known endpoint returning the caller's apparent IP in an XML
/// envelope.
const IP_LOOKUP_URL: &str = "https://geoip.ubuntu.com/lookup";

/// Name whose resolution reveals the effective recursive resolver.
const RESOLVER_PROBE_HOST: &str = "whoami.akamai.net";
const RESOLVER_PROBE_PORT: u16 = 443;

/// Upper bound for one DNS exchange; the resolver API exposes no byte
/// counts, so both directions are credited with a maximum-size datagram.
const RESOLVER_BYTES_ESTIMATE: u64 = 512;

/// Discover the probe's public IP address.
pub async fn lookup_ip(
    http: &HttpClient,
    counters: &ByteCounters,
) -> Result<String, ErrContext> {
    let body = http.get(IP_LOOKUP_URL, CONTROL_TIMEOUT, counters).await?;
    debug!(body, "IP lookup response");
    xml_extract(&body, "<Ip>", "</Ip>")
        .ok_or_else(|| ErrContext::internal("no <Ip> element in lookup response"))
}

/// Discover the public IP of the effective recursive resolver.
///
/// Resolves a fixed name through the system resolver; the answer's first
/// address is the resolver as seen by the authoritative side.
pub async fn lookup_resolver_ip(counters: &ByteCounters) -> Result<String, ErrContext> {
    counters.add_up(RESOLVER_BYTES_ESTIMATE);
    counters.add_down(RESOLVER_BYTES_ESTIMATE);

    let mut addresses = tokio::net::lookup_host((RESOLVER_PROBE_HOST, RESOLVER_PROBE_PORT))
        .await
        .map_err(|e| ErrContext::resolver(&e))?;

    match addresses.next() {
        Some(address) => Ok(address.ip().to_string()),
        None => Err(ErrContext::internal("resolver returned an empty answer")),
    }
}

/// First text between `open_tag` and `close_tag`, with whitespace removed
/// and letters lowercased.
fn xml_extract(input: &str, open_tag: &str, close_tag: &str) -> Option<String> {
    let start = input.find(open_tag)? + open_tag.len();
    let rest = &input[start..];
    let end = rest.find(close_tag)?;
    Some(
        rest[..end]
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect(),
    )
}
