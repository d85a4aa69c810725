use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use thiserror::Error;

use crate::{ENGINE_NAME, ENGINE_VERSION};

/// Default number of measurement workers when the nettest takes input
/// and `parallelism` is left at zero.
pub const DEFAULT_PARALLELISM: u8 = 3;

/// Default soft session deadline in seconds.
pub const DEFAULT_MAX_RUNTIME: u16 = 90;

/// Default bouncer endpoint.
pub const DEFAULT_BOUNCER_BASE_URL: &str = "https://bouncer.ooni.io";

/// Logging verbosity, totally ordered from quietest to noisiest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Err,
    #[default]
    Warning,
    Info,
    Debug,
    Debug2,
}

impl LogLevel {
    /// Name used in `log` event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Quiet => "QUIET",
            LogLevel::Err => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Debug2 => "DEBUG2",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "QUIET" => Some(LogLevel::Quiet),
            "ERR" => Some(LogLevel::Err),
            "WARNING" => Some(LogLevel::Warning),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            "DEBUG2" => Some(LogLevel::Debug2),
            _ => None,
        }
    }
}

/// Session configuration, immutable for the duration of one run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Nettest name. Required.
    pub name: String,

    /// User-supplied key/value labels copied into every measurement.
    pub annotations: BTreeMap<String, String>,

    /// Ordered measurement inputs. May be empty.
    pub inputs: Vec<String>,

    /// Paths to read further inputs from (consumed by the caller).
    pub input_filepaths: Vec<String>,

    /// Log destination path (consumed by the caller).
    pub log_filepath: String,

    /// Events with key `log` below this level are suppressed.
    pub log_level: LogLevel,

    /// Report destination path (consumed by the caller).
    pub output_filepath: String,

    /// Everything under the `options` sub-document.
    pub options: Options,
}

/// The `options` sub-record of the configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Declared for compatibility; unused by the session state machine.
    pub all_endpoints: bool,
    pub bouncer_base_url: String,
    /// PEM bundle loaded into the HTTP client when non-empty.
    pub ca_bundle_path: String,
    /// When non-empty, bypasses collector discovery and report opening.
    pub collector_base_url: String,
    pub engine_name: String,
    pub engine_version: String,
    pub engine_version_full: String,
    pub geoip_asn_path: String,
    pub geoip_country_path: String,
    /// Soft session deadline in seconds.
    pub max_runtime: u16,
    pub no_asn_lookup: bool,
    pub no_bouncer: bool,
    pub no_cc_lookup: bool,
    pub no_collector: bool,
    pub no_file_report: bool,
    pub no_ip_lookup: bool,
    pub no_resolver_lookup: bool,
    /// Worker count for input-taking nettests; 0 selects the default.
    pub parallelism: u8,
    pub platform: String,
    pub port: u16,
    pub probe_ip: String,
    pub probe_asn: String,
    pub probe_network_name: String,
    pub probe_cc: String,
    pub randomize_input: bool,
    pub save_real_probe_asn: bool,
    pub save_real_probe_ip: bool,
    pub save_real_probe_cc: bool,
    pub save_real_resolver_ip: bool,
    pub server: String,
    pub software_name: String,
    pub software_version: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            all_endpoints: false,
            bouncer_base_url: DEFAULT_BOUNCER_BASE_URL.to_string(),
            ca_bundle_path: String::new(),
            collector_base_url: String::new(),
            engine_name: ENGINE_NAME.to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            engine_version_full: ENGINE_VERSION.to_string(),
            geoip_asn_path: String::new(),
            geoip_country_path: String::new(),
            max_runtime: DEFAULT_MAX_RUNTIME,
            no_asn_lookup: false,
            no_bouncer: false,
            no_cc_lookup: false,
            no_collector: false,
            no_file_report: false,
            no_ip_lookup: false,
            no_resolver_lookup: false,
            parallelism: 0,
            platform: String::new(),
            port: 0,
            probe_ip: String::new(),
            probe_asn: String::new(),
            probe_network_name: String::new(),
            probe_cc: String::new(),
            randomize_input: true,
            save_real_probe_asn: true,
            save_real_probe_ip: false,
            save_real_probe_cc: true,
            save_real_resolver_ip: true,
            server: String::new(),
            software_name: ENGINE_NAME.to_string(),
            software_version: ENGINE_VERSION.to_string(),
        }
    }
}

/// Errors produced when parsing a serialized configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("configuration document is not an object")]
    NotAnObject,

    #[error("missing required entry {0:?}")]
    MissingEntry(&'static str),

    #[error("entry {path:?} has JSON type {found} where {expected} was expected")]
    WrongType {
        path: &'static str,
        found: &'static str,
        expected: &'static str,
    },

    #[error("entry {path:?} should be an integer but a fractional number was provided")]
    FractionalNumber { path: &'static str },

    #[error("entry {path:?} is out of range (minimum 0, maximum {max})")]
    OutOfRange { path: &'static str, max: u64 },

    #[error("entry \"/log_level\" must be one of QUIET, ERR, WARNING, INFO, DEBUG, DEBUG2")]
    UnknownLogLevel,
}

impl Config {
    /// Configuration with the given nettest name and default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: BTreeMap::new(),
            inputs: Vec::new(),
            input_filepaths: Vec::new(),
            log_filepath: String::new(),
            log_level: LogLevel::default(),
            output_filepath: String::new(),
            options: Options::default(),
        }
    }

    /// Parse a serialized configuration document.
    ///
    /// Absent keys keep their defaults. Returns the populated record plus
    /// compatibility warnings (currently only the number-as-boolean
    /// path), or the first structural error encountered.
    pub fn from_json(text: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let doc: Value = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        if !doc.is_object() {
            return Err(ConfigError::NotAnObject);
        }
        let options = doc.get("options").ok_or(ConfigError::MissingEntry("options"))?;
        if !options.is_object() {
            return Err(ConfigError::WrongType {
                path: "/options",
                found: json_type_name(options),
                expected: "object",
            });
        }
        let name = doc.get("name").ok_or(ConfigError::MissingEntry("name"))?;
        let name = name.as_str().ok_or(ConfigError::WrongType {
            path: "/name",
            found: json_type_name(name),
            expected: "string",
        })?;

        let mut cfg = Config::new(name);
        let mut p = Parser::new(&doc);

        p.maybe_string_map("/annotations", &mut cfg.annotations)?;
        p.maybe_string_vec("/inputs", &mut cfg.inputs)?;
        p.maybe_string_vec("/input_filepaths", &mut cfg.input_filepaths)?;
        p.maybe_string("/log_filepath", &mut cfg.log_filepath)?;
        {
            let mut level = String::new();
            p.maybe_string("/log_level", &mut level)?;
            if !level.is_empty() {
                cfg.log_level =
                    LogLevel::from_name(&level).ok_or(ConfigError::UnknownLogLevel)?;
            }
        }
        p.maybe_string("/output_filepath", &mut cfg.output_filepath)?;

        let o = &mut cfg.options;
        p.maybe_bool("/options/all_endpoints", &mut o.all_endpoints)?;
        p.maybe_string("/options/bouncer_base_url", &mut o.bouncer_base_url)?;
        p.maybe_string("/options/ca_bundle_path", &mut o.ca_bundle_path)?;
        p.maybe_string("/options/collector_base_url", &mut o.collector_base_url)?;
        p.maybe_string("/options/engine_name", &mut o.engine_name)?;
        p.maybe_string("/options/engine_version", &mut o.engine_version)?;
        p.maybe_string("/options/engine_version_full", &mut o.engine_version_full)?;
        p.maybe_string("/options/geoip_asn_path", &mut o.geoip_asn_path)?;
        p.maybe_string("/options/geoip_country_path", &mut o.geoip_country_path)?;
        p.maybe_u16("/options/max_runtime", &mut o.max_runtime)?;
        p.maybe_bool("/options/no_asn_lookup", &mut o.no_asn_lookup)?;
        p.maybe_bool("/options/no_bouncer", &mut o.no_bouncer)?;
        p.maybe_bool("/options/no_cc_lookup", &mut o.no_cc_lookup)?;
        p.maybe_bool("/options/no_collector", &mut o.no_collector)?;
        p.maybe_bool("/options/no_file_report", &mut o.no_file_report)?;
        p.maybe_bool("/options/no_ip_lookup", &mut o.no_ip_lookup)?;
        p.maybe_bool("/options/no_resolver_lookup", &mut o.no_resolver_lookup)?;
        p.maybe_u8("/options/parallelism", &mut o.parallelism)?;
        p.maybe_string("/options/platform", &mut o.platform)?;
        p.maybe_u16("/options/port", &mut o.port)?;
        p.maybe_string("/options/probe_ip", &mut o.probe_ip)?;
        p.maybe_string("/options/probe_asn", &mut o.probe_asn)?;
        p.maybe_string("/options/probe_network_name", &mut o.probe_network_name)?;
        p.maybe_string("/options/probe_cc", &mut o.probe_cc)?;
        p.maybe_bool("/options/randomize_input", &mut o.randomize_input)?;
        p.maybe_bool("/options/save_real_probe_asn", &mut o.save_real_probe_asn)?;
        p.maybe_bool("/options/save_real_probe_ip", &mut o.save_real_probe_ip)?;
        p.maybe_bool("/options/save_real_probe_cc", &mut o.save_real_probe_cc)?;
        p.maybe_bool("/options/save_real_resolver_ip", &mut o.save_real_resolver_ip)?;
        p.maybe_string("/options/server", &mut o.server)?;
        p.maybe_string("/options/software_name", &mut o.software_name)?;
        p.maybe_string("/options/software_version", &mut o.software_version)?;

        Ok((cfg, p.warnings))
    }

    /// Load a configuration from a JSON file, logging compatibility
    /// warnings through `tracing`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;

        let (cfg, warnings) = Self::from_json(&text)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;

        for warning in warnings {
            tracing::warn!(%warning, "configuration compatibility warning");
        }

        Ok(cfg)
    }
}

// --- JSON walking helpers ---

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct Parser<'a> {
    doc: &'a Value,
    warnings: Vec<String>,
    warned_number_as_bool: bool,
}

impl<'a> Parser<'a> {
    fn new(doc: &'a Value) -> Self {
        Self {
            doc,
            warnings: Vec::new(),
            warned_number_as_bool: false,
        }
    }

    fn maybe_string(&self, path: &'static str, slot: &mut String) -> Result<(), ConfigError> {
        match self.doc.pointer(path) {
            None => Ok(()),
            Some(Value::String(s)) => {
                *slot = s.clone();
                Ok(())
            }
            Some(other) => Err(ConfigError::WrongType {
                path,
                found: json_type_name(other),
                expected: "string",
            }),
        }
    }

    fn maybe_string_vec(
        &self,
        path: &'static str,
        slot: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        let entries = match self.doc.pointer(path) {
            None => return Ok(()),
            Some(Value::Array(entries)) => entries,
            Some(other) => {
                return Err(ConfigError::WrongType {
                    path,
                    found: json_type_name(other),
                    expected: "array of strings",
                })
            }
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Value::String(s) => out.push(s.clone()),
                other => {
                    return Err(ConfigError::WrongType {
                        path,
                        found: json_type_name(other),
                        expected: "array of strings",
                    })
                }
            }
        }
        *slot = out;
        Ok(())
    }

    fn maybe_string_map(
        &self,
        path: &'static str,
        slot: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        let entries = match self.doc.pointer(path) {
            None => return Ok(()),
            Some(Value::Object(entries)) => entries,
            Some(other) => {
                return Err(ConfigError::WrongType {
                    path,
                    found: json_type_name(other),
                    expected: "object of strings",
                })
            }
        };
        let mut out = BTreeMap::new();
        for (key, entry) in entries {
            match entry {
                Value::String(s) => {
                    out.insert(key.clone(), s.clone());
                }
                other => {
                    return Err(ConfigError::WrongType {
                        path,
                        found: json_type_name(other),
                        expected: "object of strings",
                    })
                }
            }
        }
        *slot = out;
        Ok(())
    }

    /// Booleans also accept a number for backward compatibility with
    /// callers that predate real boolean options: the value is false iff
    /// the number is zero, and a warning is surfaced once per document.
    fn maybe_bool(&mut self, path: &'static str, slot: &mut bool) -> Result<(), ConfigError> {
        match self.doc.pointer(path) {
            None => Ok(()),
            Some(Value::Bool(b)) => {
                *slot = *b;
                Ok(())
            }
            Some(Value::Number(n)) => {
                if !self.warned_number_as_bool {
                    self.warnings.push(format!(
                        "found a number at {path:?} and treating it as a boolean; \
                         update the configuration to use a real boolean"
                    ));
                    self.warned_number_as_bool = true;
                }
                *slot = n.as_f64().is_some_and(|v| v != 0.0);
                Ok(())
            }
            Some(other) => Err(ConfigError::WrongType {
                path,
                found: json_type_name(other),
                expected: "boolean",
            }),
        }
    }

    /// Integers are read through f64 and must be integral and within the
    /// declared width; fractional or out-of-range values are rejected
    /// rather than truncated.
    fn maybe_uint(&self, path: &'static str, max: u64) -> Result<Option<u64>, ConfigError> {
        let value = match self.doc.pointer(path) {
            None => return Ok(None),
            Some(Value::Number(n)) => n.as_f64().ok_or(ConfigError::WrongType {
                path,
                found: "number",
                expected: "integer",
            })?,
            Some(other) => {
                return Err(ConfigError::WrongType {
                    path,
                    found: json_type_name(other),
                    expected: "number",
                })
            }
        };
        if value.fract() != 0.0 {
            return Err(ConfigError::FractionalNumber { path });
        }
        if value < 0.0 || value > max as f64 {
            return Err(ConfigError::OutOfRange { path, max });
        }
        Ok(Some(value as u64))
    }

    fn maybe_u8(&self, path: &'static str, slot: &mut u8) -> Result<(), ConfigError> {
        if let Some(value) = self.maybe_uint(path, u64::from(u8::MAX))? {
            *slot = value as u8;
        }
        Ok(())
    }

    fn maybe_u16(&self, path: &'static str, slot: &mut u16) -> Result<(), ConfigError> {
        if let Some(value) = self.maybe_uint(path, u64::from(u16::MAX))? {
            *slot = value as u16;
        }
        Ok(())
    }
}
