//! Measurement runtime for network-censorship probes.
//!
//! Given a populated [`Config`] and a pluggable [`Nettest`], a [`Runner`]
//! drives one measurement session end-to-end: bouncer discovery, geo/ASN
//! and resolver enrichment, report lifecycle against a remote collector,
//! parallel per-input measurement with bounded concurrency, and a
//! structured event stream delivered through an [`EventSink`].
//!
//! At most one session runs per process at a time; everything a session
//! learns or fails to learn is reported as events, never as an abort.

pub mod bouncer;
pub mod bytes;
pub mod collector;
pub mod config;
pub mod errors;
pub mod event;
pub mod geo;
pub mod lookup;
pub mod measurement;
pub mod net;
pub mod nettest;
pub mod runner;

pub use bouncer::Endpoint;
pub use bytes::ByteCounters;
pub use config::{Config, ConfigError, LogLevel, Options};
pub use errors::ErrContext;
pub use event::{Event, EventSink, JsonLineSink};
pub use measurement::Measurement;
pub use nettest::Nettest;
pub use runner::{Runner, SessionContext};

/// Engine name reported in error contexts and measurement annotations.
pub const ENGINE_NAME: &str = "netsonde";

/// Engine version reported in error contexts and measurement annotations.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
