use std::future::Future;

use crate::bytes::ByteCounters;
use crate::config::Config;
use crate::runner::SessionContext;

/// A pluggable network measurement.
///
/// The runner invokes `run` once per input (or exactly once with an empty
/// input for nettests that take none). Implementations must tolerate
/// concurrent invocation when the configured parallelism is greater than
/// one, and may block for seconds to minutes.
pub trait Nettest: Send + Sync {
    /// Nettest name, as registered with the bouncer and the collector.
    fn name(&self) -> String;

    /// Nettest version.
    fn version(&self) -> String {
        "0.0.1".to_string()
    }

    /// Names of the test helpers this nettest requires.
    fn test_helpers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the nettest consumes per-measurement input.
    fn needs_input(&self) -> bool {
        false
    }

    /// Measure one input, returning the `test_keys` object and whether
    /// the measurement succeeded. On failure the (possibly partial)
    /// `test_keys` are still submitted and a `failure.measurement` event
    /// is emitted.
    fn run(
        &self,
        config: &Config,
        ctx: &SessionContext,
        input: &str,
        counters: &ByteCounters,
    ) -> impl Future<Output = (serde_json::Value, bool)> + Send;
}
