use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use serial_test::serial;

use netsonde::{ByteCounters, Config, Event, EventSink, Nettest, Runner, SessionContext};

/// Sink recording every event, optionally tagged to tell two concurrent
/// sessions apart on one shared timeline.
#[derive(Clone)]
struct Recorder {
    tag: usize,
    events: Arc<Mutex<Vec<(usize, Event)>>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            tag: 0,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn tagged(&self, tag: usize) -> Self {
        Self {
            tag,
            events: Arc::clone(&self.events),
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    fn timeline(&self) -> Vec<(usize, String)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(tag, event)| (*tag, event.key.clone()))
            .collect()
    }
}

impl EventSink for Recorder {
    fn on_event(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.tag, event.clone()));
    }
}

/// Nettest succeeding immediately, with or without input.
struct Noop {
    needs_input: bool,
}

impl Noop {
    fn new(needs_input: bool) -> Self {
        Self { needs_input }
    }
}

impl Nettest for Noop {
    fn name(&self) -> String {
        "noop".to_string()
    }

    fn needs_input(&self) -> bool {
        self.needs_input
    }

    async fn run(
        &self,
        _config: &Config,
        _ctx: &SessionContext,
        input: &str,
        _counters: &ByteCounters,
    ) -> (Value, bool) {
        (json!({"measured_input": input}), true)
    }
}

/// Nettest that always reports failure.
struct Failing;

impl Nettest for Failing {
    fn name(&self) -> String {
        "failing".to_string()
    }

    async fn run(
        &self,
        _config: &Config,
        _ctx: &SessionContext,
        _input: &str,
        _counters: &ByteCounters,
    ) -> (Value, bool) {
        (json!({}), false)
    }
}

/// Configuration that skips every network-facing stage, so sessions are
/// fully deterministic and offline.
fn offline_config(name: &str) -> Config {
    let mut cfg = Config::new(name);
    cfg.options.no_bouncer = true;
    cfg.options.no_ip_lookup = true;
    cfg.options.no_asn_lookup = true;
    cfg.options.no_cc_lookup = true;
    cfg.options.no_resolver_lookup = true;
    cfg.options.no_collector = true;
    cfg
}

fn keys(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.key.as_str()).collect()
}

fn count_key(events: &[Event], key: &str) -> usize {
    events.iter().filter(|e| e.key == key).count()
}

fn progress_percentages(events: &[Event]) -> Vec<f64> {
    events
        .iter()
        .filter(|e| e.key == "status.progress")
        .map(|e| e.value["percentage"].as_f64().expect("percentage"))
        .collect()
}

fn measurement_bodies(events: &[Event]) -> Vec<Value> {
    events
        .iter()
        .filter(|e| e.key == "measurement")
        .map(|e| {
            let json_str = e.value["json_str"].as_str().expect("json_str");
            serde_json::from_str(json_str).expect("measurement body parses")
        })
        .collect()
}

fn assert_lifecycle_invariants(events: &[Event]) {
    assert_eq!(count_key(events, "status.queued"), 1);
    assert_eq!(count_key(events, "status.started"), 1);
    assert_eq!(count_key(events, "status.end"), 1);
    assert_eq!(events.last().expect("events").key, "status.end");

    let percentages = progress_percentages(events);
    assert!(!percentages.is_empty());
    assert!(
        percentages.windows(2).all(|w| w[0] <= w[1]),
        "progress must be monotone non-decreasing: {percentages:?}"
    );
    assert_eq!(*percentages.last().expect("progress"), 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn session_without_input_runs_exactly_once() {
    let recorder = Recorder::new();
    let runner = Runner::with_sink(
        offline_config("noop"),
        Noop::new(false),
        Arc::new(recorder.clone()),
    );
    runner.run().await;

    let events = recorder.events();
    assert_lifecycle_invariants(&events);

    assert_eq!(count_key(&events, "status.measurement_start"), 1);
    assert_eq!(count_key(&events, "status.measurement_done"), 1);
    assert_eq!(count_key(&events, "measurement"), 1);
    assert_eq!(count_key(&events, "failure.measurement"), 0);
    assert_eq!(count_key(&events, "failure.measurement_submission"), 0);
    assert_eq!(count_key(&events, "failure.report_close"), 0);

    // Offline session: geo stages kept their sentinels and the envelope
    // applied the default redactions.
    let geoip = events
        .iter()
        .find(|e| e.key == "status.geoip_lookup")
        .expect("geoip event");
    assert_eq!(geoip.value["probe_ip"], "127.0.0.1");
    assert_eq!(geoip.value["probe_asn"], "AS0");
    assert_eq!(geoip.value["probe_cc"], "ZZ");

    let bodies = measurement_bodies(&events);
    let body = &bodies[0];
    assert_eq!(body["probe_ip"], "");
    assert_eq!(body["probe_asn"], "AS0");
    assert_eq!(body["probe_cc"], "ZZ");
    assert_eq!(body["input"], "");
    assert_eq!(body["report_id"], "");
    assert_eq!(body["test_name"], "noop");
    assert_eq!(body["test_version"], "0.0.1");
    assert!(body["test_helpers"].as_object().expect("helpers").is_empty());
    assert_eq!(body["test_keys"]["client_resolver"], "");
    assert!(body["probe_city"].is_null());

    // Nothing touched the network, so the counters stayed at zero.
    let end = events.iter().find(|e| e.key == "status.end").expect("end");
    assert_eq!(end.value["failure"], "");
    assert_eq!(end.value["downloaded_kb"], 0.0);
    assert_eq!(end.value["uploaded_kb"], 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn unexpected_inputs_are_ignored_with_a_warning() {
    let mut cfg = offline_config("noop");
    cfg.inputs = vec!["a".to_string(), "b".to_string(), "c".to_string()];

    let recorder = Recorder::new();
    let nettest = Noop::new(false);
    let runner = Runner::with_sink(cfg, nettest, Arc::new(recorder.clone()));
    runner.run().await;

    let events = recorder.events();
    assert_lifecycle_invariants(&events);

    // One measurement with empty input, despite three supplied inputs.
    assert_eq!(count_key(&events, "measurement"), 1);
    let bodies = measurement_bodies(&events);
    assert_eq!(bodies[0]["input"], "");

    let warning = events
        .iter()
        .filter(|e| e.key == "log")
        .find(|e| e.value["log_level"] == "WARNING")
        .expect("warning log");
    assert!(warning.value["message"]
        .as_str()
        .expect("message")
        .contains("ignoring"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn input_fanout_measures_every_input() {
    let mut cfg = offline_config("fanout");
    cfg.inputs = vec!["x".to_string(), "y".to_string()];
    cfg.options.parallelism = 2;
    cfg.options.randomize_input = false;

    let recorder = Recorder::new();
    let runner = Runner::with_sink(cfg, Noop::new(true), Arc::new(recorder.clone()));
    runner.run().await;

    let events = recorder.events();
    assert_lifecycle_invariants(&events);
    assert_eq!(count_key(&events, "status.measurement_start"), 2);
    assert_eq!(count_key(&events, "status.measurement_done"), 2);
    assert_eq!(count_key(&events, "measurement"), 2);

    // Per-index ordering: start, then the measurement, then done; any
    // interleaving across indexes is allowed.
    for idx in 0..2u32 {
        let position = |key: &str| {
            events
                .iter()
                .position(|e| e.key == key && e.value["idx"] == idx)
                .unwrap_or_else(|| panic!("missing {key} for idx {idx}"))
        };
        let start = position("status.measurement_start");
        let body = position("measurement");
        let done = position("status.measurement_done");
        assert!(start < body, "idx {idx}: start must precede measurement");
        assert!(body < done, "idx {idx}: measurement must precede done");
    }

    let mut measured: Vec<String> = measurement_bodies(&events)
        .iter()
        .map(|b| b["input"].as_str().expect("input").to_string())
        .collect();
    measured.sort();
    assert_eq!(measured, vec!["x".to_string(), "y".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn inputs_preserve_order_when_randomization_is_off() {
    let mut cfg = offline_config("ordered");
    cfg.inputs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    cfg.options.parallelism = 1;
    cfg.options.randomize_input = false;

    let recorder = Recorder::new();
    let runner = Runner::with_sink(cfg, Noop::new(true), Arc::new(recorder.clone()));
    runner.run().await;

    let events = recorder.events();
    let by_idx: Vec<(u64, String)> = measurement_bodies(&events)
        .iter()
        .zip(events.iter().filter(|e| e.key == "measurement"))
        .map(|(body, event)| {
            (
                event.value["idx"].as_u64().expect("idx"),
                body["input"].as_str().expect("input").to_string(),
            )
        })
        .collect();

    let mut sorted = by_idx.clone();
    sorted.sort_by_key(|(idx, _)| *idx);
    let inputs: Vec<&str> = sorted.iter().map(|(_, input)| input.as_str()).collect();
    assert_eq!(inputs, vec!["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn empty_inputs_skip_fanout_but_finish_the_session() {
    let cfg = offline_config("empty");

    let recorder = Recorder::new();
    let runner = Runner::with_sink(cfg, Noop::new(true), Arc::new(recorder.clone()));
    runner.run().await;

    let events = recorder.events();
    assert_lifecycle_invariants(&events);

    assert_eq!(count_key(&events, "status.measurement_start"), 0);
    assert_eq!(count_key(&events, "measurement"), 0);
    assert!(
        !keys(&events).iter().any(|k| k.starts_with("failure.")),
        "no failure events expected: {:?}",
        keys(&events)
    );

    let warning = events
        .iter()
        .filter(|e| e.key == "log")
        .find(|e| e.value["log_level"] == "WARNING")
        .expect("warning log");
    assert!(warning.value["message"]
        .as_str()
        .expect("message")
        .contains("no input"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn failed_measurement_is_reported_and_still_emitted() {
    let recorder = Recorder::new();
    let runner = Runner::with_sink(
        offline_config("failing"),
        Failing,
        Arc::new(recorder.clone()),
    );
    runner.run().await;

    let events = recorder.events();
    assert_lifecycle_invariants(&events);

    let failure = events
        .iter()
        .find(|e| e.key == "failure.measurement")
        .expect("failure.measurement");
    assert_eq!(failure.value["failure"], "generic_error");
    assert_eq!(failure.value["idx"], 0);

    // The envelope is still serialized and emitted after the failure.
    assert_eq!(count_key(&events, "measurement"), 1);
    let failure_at = events
        .iter()
        .position(|e| e.key == "failure.measurement")
        .expect("position");
    let measurement_at = events
        .iter()
        .position(|e| e.key == "measurement")
        .expect("position");
    assert!(failure_at < measurement_at);

    // The session outcome is unaffected.
    let end = events.iter().find(|e| e.key == "status.end").expect("end");
    assert_eq!(end.value["failure"], "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn interrupt_stops_claiming_before_the_first_input() {
    let mut cfg = offline_config("interrupted");
    cfg.inputs = vec!["x".to_string(), "y".to_string()];

    let recorder = Recorder::new();
    let nettest = Noop::new(true);
    let runner = Runner::with_sink(cfg, nettest, Arc::new(recorder.clone()));
    runner.interrupt();
    runner.run().await;

    let events = recorder.events();
    assert_lifecycle_invariants(&events);
    assert_eq!(count_key(&events, "status.measurement_start"), 0);
    assert_eq!(count_key(&events, "measurement"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn zero_max_runtime_stops_workers_immediately() {
    let mut cfg = offline_config("deadline");
    cfg.inputs = vec!["x".to_string()];
    cfg.options.max_runtime = 0;

    let recorder = Recorder::new();
    let runner = Runner::with_sink(cfg, Noop::new(true), Arc::new(recorder.clone()));
    runner.run().await;

    let events = recorder.events();
    assert_lifecycle_invariants(&events);
    assert_eq!(count_key(&events, "status.measurement_start"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn redaction_switches_control_the_envelope() {
    let mut cfg = offline_config("redaction");
    cfg.options.probe_ip = "93.184.216.34".to_string();
    cfg.options.probe_asn = "AS15133".to_string();
    cfg.options.probe_network_name = "Edgecast".to_string();
    cfg.options.probe_cc = "US".to_string();
    cfg.options.save_real_probe_ip = true;
    cfg.options.save_real_probe_asn = false;

    let recorder = Recorder::new();
    let runner = Runner::with_sink(cfg, Noop::new(false), Arc::new(recorder.clone()));
    runner.run().await;

    let bodies = measurement_bodies(&recorder.events());
    let body = &bodies[0];
    assert_eq!(body["probe_ip"], "93.184.216.34");
    assert_eq!(body["probe_asn"], "");
    assert_eq!(body["annotations"]["probe_network_name"], "");
    assert_eq!(body["probe_cc"], "US");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn overlapping_sessions_are_mutually_exclusive() {
    let shared = Recorder::new();

    let first = Runner::with_sink(
        offline_config("first"),
        Noop::new(false),
        Arc::new(shared.tagged(1)),
    );
    let second = Runner::with_sink(
        offline_config("second"),
        Noop::new(false),
        Arc::new(shared.tagged(2)),
    );

    let first = tokio::spawn(async move { first.run().await });
    let second = tokio::spawn(async move { second.run().await });
    first.await.expect("first session");
    second.await.expect("second session");

    let timeline = shared.timeline();
    let position = |tag: usize, key: &str| {
        timeline
            .iter()
            .position(|(t, k)| *t == tag && k == key)
            .unwrap_or_else(|| panic!("missing {key} for session {tag}"))
    };

    let (start_1, end_1) = (position(1, "status.started"), position(1, "status.end"));
    let (start_2, end_2) = (position(2, "status.started"), position(2, "status.end"));

    assert!(start_1 < end_1);
    assert!(start_2 < end_2);
    assert!(
        end_1 < start_2 || end_2 < start_1,
        "sessions must not overlap: {timeline:?}"
    );
}
