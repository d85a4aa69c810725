use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::bouncer::Endpoint;
use crate::config::Config;
use crate::runner::SessionContext;

/// One measurement envelope, submitted to the collector and emitted in
/// the `measurement` event.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub annotations: BTreeMap<String, String>,
    pub id: String,
    pub input: String,
    pub input_hashes: Vec<String>,
    pub measurement_start_time: String,
    pub options: Vec<String>,
    pub probe_asn: String,
    pub probe_cc: String,
    /// Never populated; serialized as `null`.
    pub probe_city: Option<String>,
    pub probe_ip: String,
    pub report_id: String,
    pub software_name: String,
    pub software_version: String,
    pub test_helpers: BTreeMap<String, TestHelperEntry>,
    pub test_name: String,
    pub test_start_time: String,
    pub test_version: String,
    pub test_runtime: f64,
    pub test_keys: Value,
}

/// One test helper reference inside an envelope.
#[derive(Debug, Clone, Serialize)]
pub struct TestHelperEntry {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub front: Option<String>,
}

impl From<&Endpoint> for TestHelperEntry {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            address: endpoint.address().to_string(),
            kind: endpoint.kind(),
            front: endpoint.front().map(str::to_string),
        }
    }
}

impl Measurement {
    /// Build the envelope for one input, applying the configured
    /// redactions. `test_runtime` and `test_keys` are filled after the
    /// nettest returns.
    pub fn build(
        config: &Config,
        ctx: &SessionContext,
        test_name: &str,
        test_version: &str,
        test_start_time: &str,
        input: &str,
    ) -> Self {
        let opts = &config.options;

        let mut annotations = config.annotations.clone();
        annotations.insert("engine_name".to_string(), opts.engine_name.clone());
        annotations.insert("engine_version".to_string(), opts.engine_version.clone());
        annotations.insert(
            "engine_version_full".to_string(),
            opts.engine_version_full.clone(),
        );
        annotations.insert(
            "platform".to_string(),
            if opts.platform.is_empty() {
                platform_name().to_string()
            } else {
                opts.platform.clone()
            },
        );
        annotations.insert(
            "probe_network_name".to_string(),
            redact(opts.save_real_probe_asn, &ctx.probe_network_name),
        );

        // Helpers are keyed by name; with several endpoints per helper
        // the last one wins, for compatibility with existing consumers.
        let mut test_helpers = BTreeMap::new();
        for (name, endpoints) in &ctx.test_helpers {
            for endpoint in endpoints {
                test_helpers.insert(name.clone(), TestHelperEntry::from(endpoint));
            }
        }

        Self {
            annotations,
            id: Uuid::new_v4().to_string(),
            input: input.to_string(),
            input_hashes: Vec::new(),
            measurement_start_time: utc_now_string(),
            options: Vec::new(),
            probe_asn: redact(opts.save_real_probe_asn, &ctx.probe_asn),
            probe_cc: redact(opts.save_real_probe_cc, &ctx.probe_cc),
            probe_city: None,
            probe_ip: redact(opts.save_real_probe_ip, &ctx.probe_ip),
            report_id: ctx.report_id.clone(),
            software_name: opts.software_name.clone(),
            software_version: opts.software_version.clone(),
            test_helpers,
            test_name: test_name.to_string(),
            test_start_time: test_start_time.to_string(),
            test_version: test_version.to_string(),
            test_runtime: 0.0,
            test_keys: Value::Object(serde_json::Map::new()),
        }
    }

    /// Install the nettest's output, then force `client_resolver`.
    ///
    /// `client_resolver` is written after the install so that a nettest
    /// can never overwrite it. Non-object output is replaced with an
    /// empty object, since the field must be settable.
    pub fn set_test_keys(&mut self, test_keys: Value, client_resolver: &str) {
        self.test_keys = match test_keys {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(serde_json::Map::new()),
        };
        if let Value::Object(map) = &mut self.test_keys {
            map.insert(
                "client_resolver".to_string(),
                Value::String(client_resolver.to_string()),
            );
        }
    }
}

fn redact(save_real: bool, value: &str) -> String {
    if save_real {
        value.to_string()
    } else {
        String::new()
    }
}

/// Platform label for measurement annotations.
pub fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "android" => "android",
        "linux" => "linux",
        "windows" => "windows",
        "ios" => "ios",
        "macos" => "macos",
        _ => "unknown",
    }
}

/// Current UTC time as `%Y-%m-%d %H:%M:%S`, without fractional seconds.
pub fn utc_now_string() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
