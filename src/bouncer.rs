use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytes::ByteCounters;
use crate::errors::ErrContext;
use crate::net::{trim_trailing_slashes, HttpClient, CONTROL_TIMEOUT};

/// A collector or test-helper endpoint, tagged by access method.
///
/// `front` is the fronting domain and is only meaningful for the
/// cloudfront variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Onion { address: String },
    Https { address: String },
    Cloudfront { address: String, front: String },
}

impl Endpoint {
    pub fn address(&self) -> &str {
        match self {
            Endpoint::Onion { address }
            | Endpoint::Https { address }
            | Endpoint::Cloudfront { address, .. } => address,
        }
    }

    /// Tag used on the wire and in measurement envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Onion { .. } => "onion",
            Endpoint::Https { .. } => "https",
            Endpoint::Cloudfront { .. } => "cloudfront",
        }
    }

    pub fn front(&self) -> Option<&str> {
        match self {
            Endpoint::Cloudfront { front, .. } => Some(front),
            _ => None,
        }
    }
}

/// Test-helper endpoints discovered for one session, keyed by helper name.
pub type HelperMap = BTreeMap<String, Vec<Endpoint>>;

// --- Wire structures ---

#[derive(Serialize)]
struct BouncerRequest<'a> {
    #[serde(rename = "net-tests")]
    net_tests: [BouncerRequestEntry<'a>; 1],
}

#[derive(Serialize)]
struct BouncerRequestEntry<'a> {
    #[serde(rename = "input-hashes")]
    input_hashes: Option<()>,
    name: &'a str,
    #[serde(rename = "test-helpers")]
    test_helpers: &'a [String],
    version: &'a str,
}

#[derive(Deserialize)]
struct BouncerReply {
    #[serde(rename = "net-tests")]
    net_tests: Vec<BouncerReplyEntry>,
}

#[derive(Deserialize)]
struct BouncerReplyEntry {
    collector: String,
    #[serde(rename = "collector-alternate", default)]
    collector_alternate: Vec<WireEndpoint>,
    #[serde(rename = "test-helpers", default)]
    test_helpers: BTreeMap<String, String>,
    #[serde(rename = "test-helpers-alternate", default)]
    test_helpers_alternate: BTreeMap<String, Vec<WireEndpoint>>,
}

#[derive(Deserialize)]
struct WireEndpoint {
    #[serde(rename = "type")]
    kind: String,
    address: Option<String>,
    front: Option<String>,
}

impl WireEndpoint {
    /// Convert one alternate entry. Unknown types yield `None` and are
    /// skipped; known types with missing fields are schema violations.
    fn into_endpoint(self) -> Result<Option<Endpoint>, ErrContext> {
        match self.kind.as_str() {
            "https" => {
                let address = self
                    .address
                    .ok_or_else(|| ErrContext::internal("https endpoint without address"))?;
                Ok(Some(Endpoint::Https { address }))
            }
            "cloudfront" => {
                let address = self
                    .address
                    .ok_or_else(|| ErrContext::internal("cloudfront endpoint without address"))?;
                let front = self
                    .front
                    .ok_or_else(|| ErrContext::internal("cloudfront endpoint without front"))?;
                Ok(Some(Endpoint::Cloudfront { address, front }))
            }
            _ => Ok(None),
        }
    }
}

/// Ask the bouncer for the collectors and test helpers suitable for the
/// given nettest.
pub async fn query_bouncer(
    http: &HttpClient,
    base_url: &str,
    nettest_name: &str,
    helper_names: &[String],
    nettest_version: &str,
    counters: &ByteCounters,
) -> Result<(Vec<Endpoint>, HelperMap), ErrContext> {
    let request = BouncerRequest {
        net_tests: [BouncerRequestEntry {
            input_hashes: None,
            name: nettest_name,
            test_helpers: helper_names,
            version: nettest_version,
        }],
    };
    let body = serde_json::to_string(&request).map_err(|e| ErrContext::json(&e))?;

    let url = format!("{}/bouncer/net-tests", trim_trailing_slashes(base_url));
    debug!(url, body, "querying bouncer");

    let reply = http.post_json(&url, body, CONTROL_TIMEOUT, counters).await?;
    debug!(reply, "bouncer reply");

    let reply: BouncerReply = serde_json::from_str(&reply).map_err(|e| ErrContext::json(&e))?;

    let mut collectors = Vec::new();
    let mut helpers: HelperMap = BTreeMap::new();

    for entry in reply.net_tests {
        collectors.push(Endpoint::Onion {
            address: entry.collector,
        });
        for wire in entry.collector_alternate {
            if let Some(endpoint) = wire.into_endpoint()? {
                collectors.push(endpoint);
            }
        }
        for (name, address) in entry.test_helpers {
            helpers
                .entry(name)
                .or_default()
                .push(Endpoint::Onion { address });
        }
        for (name, wires) in entry.test_helpers_alternate {
            for wire in wires {
                if let Some(endpoint) = wire.into_endpoint()? {
                    helpers.entry(name.clone()).or_default().push(endpoint);
                }
            }
        }
    }

    Ok((collectors, helpers))
}
