use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bouncer::{self, Endpoint, HelperMap};
use crate::bytes::ByteCounters;
use crate::collector::{self, OpenReportRequest};
use crate::config::{Config, LogLevel, DEFAULT_PARALLELISM};
use crate::errors::ErrContext;
use crate::event::{Event, EventSink, JsonLineSink};
use crate::geo;
use crate::lookup;
use crate::measurement::{utc_now_string, Measurement};
use crate::net::HttpClient;
use crate::nettest::Nettest;

/// Sentinel probe IP when the lookup is skipped, fails, or is pending.
const PROBE_IP_SENTINEL: &str = "127.0.0.1";

/// Sentinel ASN when the lookup is skipped or fails.
const PROBE_ASN_SENTINEL: &str = "AS0";

/// Sentinel country code when the lookup is skipped or fails.
const PROBE_CC_SENTINEL: &str = "ZZ";

/// Process-wide session gate: at most one session runs at a time. FIFO
/// ordering across waiters is not guaranteed.
static SESSION_GATE: Mutex<()> = Mutex::const_new(());

/// Mutable session state, built incrementally by the discovery stages and
/// read-only for workers.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub collectors: Vec<Endpoint>,
    pub test_helpers: HelperMap,
    pub probe_ip: String,
    pub probe_asn: String,
    pub probe_network_name: String,
    pub probe_cc: String,
    pub resolver_ip: String,
    pub report_id: String,
}

/// Shared per-session state handed to the measurement workers.
struct SessionState {
    begin: Instant,
    test_start_time: String,
    inputs: Vec<String>,
    ctx: Arc<SessionContext>,
    collector_base_url: String,
    http: HttpClient,
    counters: Arc<ByteCounters>,
}

/// The session orchestrator.
///
/// Composes the bouncer/collector clients, the enrichment probes, and the
/// nettest into one measurement session, reporting every transition
/// through the event sink. Cheap to clone; clones share the same session.
pub struct Runner<N> {
    inner: Arc<Inner<N>>,
}

struct Inner<N> {
    config: Config,
    nettest: N,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl<N> Clone for Runner<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: Nettest + 'static> Runner<N> {
    /// Runner emitting JSON lines on standard error.
    pub fn new(config: Config, nettest: N) -> Self {
        Self::with_sink(config, nettest, Arc::new(JsonLineSink::new()))
    }

    /// Runner emitting through a caller-supplied sink.
    pub fn with_sink(config: Config, nettest: N, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                nettest,
                sink,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Cooperatively interrupt the session: workers stop claiming new
    /// inputs at their next loop iteration; in-flight measurements
    /// complete normally.
    pub fn interrupt(&self) {
        self.inner.cancel.cancel();
    }

    /// Configured log level.
    pub fn log_level(&self) -> LogLevel {
        self.inner.config.log_level
    }

    /// Run one measurement session end-to-end.
    ///
    /// Blocks (asynchronously) until any other session in this process
    /// has finished. Single-stage failures are reported as `failure.*`
    /// events and never abort the session.
    pub async fn run(&self) {
        let cfg = &self.inner.config;
        let counters = Arc::new(ByteCounters::new());

        self.emit("status.queued", json!({}));
        let _session = SESSION_GATE.lock().await;
        let begin = Instant::now();
        let mut ctx = SessionContext::default();
        self.emit("status.started", json!({}));

        let http = match HttpClient::new(&cfg.options.ca_bundle_path) {
            Ok(http) => http,
            Err(e) => {
                self.log(LogLevel::Warning, format!("run: cannot load CA bundle: {e:#}"));
                HttpClient::plain()
            }
        };

        // 1. Bouncer discovery. Failures are tolerated: the session
        // continues with empty collectors and helpers.
        if !cfg.options.no_bouncer {
            match bouncer::query_bouncer(
                &http,
                &cfg.options.bouncer_base_url,
                &self.inner.nettest.name(),
                &self.inner.nettest.test_helpers(),
                &self.inner.nettest.version(),
                &counters,
            )
            .await
            {
                Ok((collectors, helpers)) => {
                    ctx.collectors = collectors;
                    ctx.test_helpers = helpers;
                }
                Err(err) => {
                    self.log(
                        LogLevel::Warning,
                        format!("run: query_bouncer() failed: {}", err.reason),
                    );
                }
            }
        }
        self.progress(0.1, "contact bouncer");

        // 2. Geo enrichment. The no_* switches control whether a lookup
        // runs; the save_real_* switches separately control whether the
        // result reaches the report. A value supplied in the
        // configuration wins and no lookup occurs.
        if cfg.options.probe_ip.is_empty() {
            ctx.probe_ip = PROBE_IP_SENTINEL.to_string();
            if !cfg.options.no_ip_lookup {
                match lookup::lookup_ip(&http, &counters).await {
                    Ok(ip) => {
                        ctx.probe_ip = ip;
                        self.log(
                            LogLevel::Info,
                            format!("Your public IP address: {}", ctx.probe_ip),
                        );
                    }
                    Err(err) => {
                        self.log(LogLevel::Warning, "run: lookup_ip() failed");
                        self.emit_library_failure("failure.ip_lookup", &err);
                    }
                }
            }
        } else {
            ctx.probe_ip = cfg.options.probe_ip.clone();
        }

        // A supplied probe_asn also pins probe_network_name, even when
        // the latter is empty.
        if cfg.options.probe_asn.is_empty() {
            ctx.probe_asn = PROBE_ASN_SENTINEL.to_string();
            if !cfg.options.no_asn_lookup {
                match geo::lookup_asn(&cfg.options.geoip_asn_path, &ctx.probe_ip) {
                    Ok((asn, network_name)) => {
                        ctx.probe_asn = asn;
                        ctx.probe_network_name = network_name;
                        self.log(
                            LogLevel::Info,
                            format!("Your ISP number: {}", ctx.probe_asn),
                        );
                        self.log(
                            LogLevel::Debug,
                            format!("Your ISP name: {}", ctx.probe_network_name),
                        );
                    }
                    Err(err) => {
                        self.log(LogLevel::Warning, "run: lookup_asn() failed");
                        self.emit_library_failure("failure.asn_lookup", &err);
                    }
                }
            }
        } else {
            ctx.probe_network_name = cfg.options.probe_network_name.clone();
            ctx.probe_asn = cfg.options.probe_asn.clone();
        }

        if cfg.options.probe_cc.is_empty() {
            ctx.probe_cc = PROBE_CC_SENTINEL.to_string();
            if !cfg.options.no_cc_lookup {
                match geo::lookup_cc(&cfg.options.geoip_country_path, &ctx.probe_ip) {
                    Ok(cc) => {
                        ctx.probe_cc = cc;
                        self.log(LogLevel::Info, format!("Your country: {}", ctx.probe_cc));
                    }
                    Err(err) => {
                        self.log(LogLevel::Warning, "run: lookup_cc() failed");
                        self.emit_library_failure("failure.cc_lookup", &err);
                    }
                }
            }
        } else {
            ctx.probe_cc = cfg.options.probe_cc.clone();
        }

        self.progress(0.2, "geoip lookup");
        self.emit(
            "status.geoip_lookup",
            json!({
                "probe_cc": ctx.probe_cc,
                "probe_asn": ctx.probe_asn,
                "probe_ip": ctx.probe_ip,
                "probe_network_name": ctx.probe_network_name,
            }),
        );

        // 3. Resolver discovery.
        if !cfg.options.no_resolver_lookup {
            match lookup::lookup_resolver_ip(&counters).await {
                Ok(ip) => ctx.resolver_ip = ip,
                Err(err) => {
                    self.log(LogLevel::Warning, "run: lookup_resolver_ip() failed");
                    self.emit_library_failure("failure.resolver_lookup", &err);
                }
            }
        }
        self.log(
            LogLevel::Debug,
            format!("resolver_ip: {}", ctx.resolver_ip),
        );
        self.progress(0.3, "resolver lookup");
        self.emit(
            "status.resolver_lookup",
            json!({"resolver_ip": ctx.resolver_ip}),
        );

        let test_start_time = utc_now_string();

        // 4. Report lifecycle. A configured collector URL bypasses both
        // discovery and open_report; otherwise the first discovered https
        // collector is used.
        let mut collector_base_url = String::new();
        if !cfg.options.no_collector {
            if cfg.options.collector_base_url.is_empty() {
                for endpoint in &ctx.collectors {
                    if let Endpoint::Https { address } = endpoint {
                        self.log(
                            LogLevel::Info,
                            format!("Using discovered collector: {address}"),
                        );
                        collector_base_url = address.clone();
                        break;
                    }
                }
                self.log(LogLevel::Info, "Opening report; please be patient...");
                let nettest_name = self.inner.nettest.name();
                let nettest_version = self.inner.nettest.version();
                let request = OpenReportRequest::new(
                    &ctx.probe_asn,
                    &ctx.probe_cc,
                    &cfg.options.software_name,
                    &cfg.options.software_version,
                    &nettest_name,
                    &test_start_time,
                    &nettest_version,
                );
                match collector::open_report(&http, &collector_base_url, &request, &counters)
                    .await
                {
                    Ok(report_id) => {
                        ctx.report_id = report_id;
                        self.log(LogLevel::Info, format!("Report ID: {}", ctx.report_id));
                        self.emit(
                            "status.report_create",
                            json!({"report_id": ctx.report_id}),
                        );
                    }
                    Err(err) => {
                        self.log(LogLevel::Warning, "run: open_report() failed");
                        self.emit_library_failure("failure.report_create", &err);
                    }
                }
            } else {
                collector_base_url = cfg.options.collector_base_url.clone();
            }
        }
        self.progress(0.4, "open report");

        // 5. Input fan-out. Context writes are complete; workers only
        // read it from here on.
        let ctx = Arc::new(ctx);

        let inputs = if self.inner.nettest.needs_input() {
            if cfg.inputs.is_empty() {
                self.log(LogLevel::Warning, "run: no input provided");
                None
            } else {
                Some(cfg.inputs.clone())
            }
        } else {
            if !cfg.inputs.is_empty() {
                self.log(LogLevel::Warning, "run: got unexpected input; ignoring it");
            }
            Some(vec![String::new()])
        };

        if let Some(mut inputs) = inputs {
            if cfg.options.randomize_input {
                let mut rng = StdRng::from_entropy();
                inputs.shuffle(&mut rng);
            }

            let parallelism =
                effective_parallelism(self.inner.nettest.needs_input(), cfg.options.parallelism);

            let state = Arc::new(SessionState {
                begin,
                test_start_time: test_start_time.clone(),
                inputs,
                ctx: Arc::clone(&ctx),
                collector_base_url: collector_base_url.clone(),
                http: http.clone(),
                counters: Arc::clone(&counters),
            });

            let next_index = Arc::new(AtomicU64::new(0));
            let mut workers = JoinSet::new();
            for _ in 0..parallelism {
                let runner = self.clone();
                let state = Arc::clone(&state);
                let next_index = Arc::clone(&next_index);
                workers.spawn(async move {
                    loop {
                        // The cancellation flag is only observed here, so
                        // an in-flight measurement always completes.
                        if runner.inner.cancel.is_cancelled() {
                            break;
                        }
                        let idx = next_index.fetch_add(1, Ordering::SeqCst);
                        // The index is capped at u32::MAX to ease integer
                        // interop for downstream consumers.
                        if idx >= state.inputs.len() as u64 || idx > u64::from(u32::MAX) {
                            break;
                        }
                        if !runner.run_with_index(&state, idx as u32).await {
                            break;
                        }
                    }
                });
            }
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "measurement worker join failed");
                }
            }
        }
        self.progress(0.9, "measurement complete");

        // 6. Report close.
        if !cfg.options.no_collector && !ctx.report_id.is_empty() {
            match collector::close_report(&http, &collector_base_url, &ctx.report_id, &counters)
                .await
            {
                Ok(()) => {
                    self.emit("status.report_close", json!({"report_id": ctx.report_id}));
                }
                Err(err) => {
                    self.log(LogLevel::Warning, "run: close_report() failed");
                    self.emit_library_failure("failure.report_close", &err);
                }
            }
        } else if !cfg.options.no_collector {
            self.emit(
                "failure.report_close",
                json!({"failure": "report_not_open_error"}),
            );
        }
        self.progress(1.0, "report close");

        // Intermediate failures were already surfaced per stage; the
        // session itself always ends successfully.
        self.emit(
            "status.end",
            json!({
                "failure": "",
                "downloaded_kb": counters.down_kb(),
                "uploaded_kb": counters.up_kb(),
            }),
        );
    }

    /// Measure the input at `idx`. Returns false when the worker should
    /// stop claiming further inputs.
    async fn run_with_index(&self, state: &SessionState, idx: u32) -> bool {
        let cfg = &self.inner.config;

        // The deadline leaves headroom for submitting the tail of the
        // measurements and closing the report.
        let elapsed = state.begin.elapsed().as_secs_f64();
        if elapsed >= f64::from(cfg.options.max_runtime) * 0.9 {
            self.log(LogLevel::Info, "exceeded max runtime");
            return false;
        }

        let input = &state.inputs[idx as usize];
        self.emit(
            "status.measurement_start",
            json!({"idx": idx, "input": input}),
        );

        let mut measurement = Measurement::build(
            cfg,
            &state.ctx,
            &self.inner.nettest.name(),
            &self.inner.nettest.version(),
            &state.test_start_time,
            input,
        );

        let measurement_start = Instant::now();
        let (test_keys, ok) = self
            .inner
            .nettest
            .run(cfg, &state.ctx, input, &state.counters)
            .await;
        measurement.test_runtime = measurement_start.elapsed().as_secs_f64();

        let client_resolver = if cfg.options.save_real_resolver_ip {
            state.ctx.resolver_ip.as_str()
        } else {
            ""
        };
        measurement.set_test_keys(test_keys, client_resolver);

        if !ok {
            self.emit(
                "failure.measurement",
                json!({"failure": "generic_error", "idx": idx}),
            );
        }

        match serde_json::to_string(&measurement) {
            Ok(json_str) => {
                if !cfg.options.no_collector && !state.ctx.report_id.is_empty() {
                    match collector::update_report(
                        &state.http,
                        &state.collector_base_url,
                        &state.ctx.report_id,
                        &json_str,
                        &state.counters,
                    )
                    .await
                    {
                        Ok(()) => {
                            self.emit("status.measurement_submission", json!({"idx": idx}));
                        }
                        Err(err) => {
                            self.log(LogLevel::Warning, "run: update_report() failed");
                            self.emit(
                                "failure.measurement_submission",
                                json!({
                                    "failure": "library_error",
                                    "library_error_context": err,
                                    "idx": idx,
                                    "json_str": &json_str,
                                }),
                            );
                        }
                    }
                } else if !cfg.options.no_collector {
                    self.emit(
                        "failure.measurement_submission",
                        json!({"failure": "report_not_open_error"}),
                    );
                }
                // Consumers rely on seeing the submission status before
                // the measurement body.
                self.emit("measurement", json!({"idx": idx, "json_str": json_str}));
            }
            Err(e) => {
                self.log(
                    LogLevel::Warning,
                    format!("run: cannot serialize measurement: {e}"),
                );
            }
        }

        self.emit("status.measurement_done", json!({"idx": idx}));
        true
    }

    // --- Event emission helpers ---

    fn emit(&self, key: &str, value: serde_json::Value) {
        let event = Event {
            key: key.to_string(),
            value,
        };
        self.inner.sink.on_event(&event);
    }

    fn progress(&self, percentage: f64, message: &str) {
        self.emit(
            "status.progress",
            json!({"percentage": percentage, "message": message}),
        );
    }

    fn emit_library_failure(&self, key: &str, err: &ErrContext) {
        self.emit(
            key,
            json!({"failure": "library_error", "library_error_context": err}),
        );
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        if self.inner.config.log_level >= level {
            self.emit(
                "log",
                json!({"log_level": level.as_str(), "message": message.into()}),
            );
        }
    }
}

/// Worker count for the fan-out: one worker for nettests without input,
/// otherwise the configured parallelism with zero meaning the default.
fn effective_parallelism(needs_input: bool, configured: u8) -> u8 {
    if !needs_input {
        1
    } else if configured > 0 {
        configured
    } else {
        DEFAULT_PARALLELISM
    }
}
