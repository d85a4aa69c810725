use std::io::Write;
use std::sync::{Mutex, PoisonError};

use serde_json::json;

/// One record of the session event stream.
///
/// `value` is always a JSON object; events are immutable once emitted.
#[derive(Debug, Clone)]
pub struct Event {
    pub key: String,
    pub value: serde_json::Value,
}

/// Receiver for session events.
///
/// Implementations must be thread-safe: workers emit measurement events
/// concurrently when parallelism is greater than one.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Default sink: one JSON line per event on standard error.
///
/// Lines are written under a lock so concurrent workers never interleave
/// partial records.
#[derive(Debug, Default)]
pub struct JsonLineSink {
    lock: Mutex<()>,
}

impl JsonLineSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for JsonLineSink {
    fn on_event(&self, event: &Event) {
        let line = json!({"key": event.key, "value": event.value});
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Recorder(Mutex<Vec<Event>>);

    impl EventSink for Recorder {
        fn on_event(&self, event: &Event) {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        }
    }

    #[test]
    fn test_sink_receives_key_and_value() {
        let sink = Recorder(Mutex::new(Vec::new()));
        sink.on_event(&Event {
            key: "status.queued".to_string(),
            value: json!({}),
        });

        let events = sink.0.lock().expect("lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "status.queued");
        assert!(events[0].value.as_object().expect("object").is_empty());
    }

    #[test]
    fn test_sink_is_shareable_across_threads() {
        let sink: Arc<dyn EventSink> = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut handles = Vec::new();
        for i in 0..4 {
            let sink = Arc::clone(&sink);
            handles.push(std::thread::spawn(move || {
                sink.on_event(&Event {
                    key: "log".to_string(),
                    value: json!({"log_level": "DEBUG", "message": format!("thread {i}")}),
                });
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
    }
}
