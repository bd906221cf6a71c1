use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use capture_device_control::backend::ports::DevicePort;
use capture_device_control::operation::{OperationKind, OperationOutcome};
use capture_device_control::presenter::{
    NoticeLevel, Notifier, Presenter, PresenterConfig, PresenterController,
};

use crate::output::{percent, port_to_value, Dialog, Event, OutputOptions, Reporter};

#[derive(serde::Serialize)]
pub struct JsonEvent {
    schema: u32,
    event: &'static str,
    #[serde(flatten)]
    fields: BTreeMap<&'static str, serde_json::Value>,
}

impl JsonEvent {
    pub fn status(event: &'static str) -> Self {
        Self {
            schema: 1,
            event,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_u64(mut self, k: &'static str, v: u64) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_i64(mut self, k: &'static str, v: i64) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_str(mut self, k: &'static str, v: &str) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_bool(mut self, k: &'static str, v: bool) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_value(mut self, k: &'static str, v: serde_json::Value) -> Self {
        self.fields.insert(k, v);
        self
    }
}

/// Serializes events to stdout, one per line.
struct JsonSink {
    timestamps: bool,
    start: Instant,
}

impl JsonSink {
    fn render(&self, ev: JsonEvent) -> String {
        let mut ev = ev;
        if self.timestamps {
            ev.fields.insert(
                "t_ms",
                serde_json::Value::from(self.start.elapsed().as_millis() as u64),
            );
        }
        serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string())
    }

    fn write(&self, ev: JsonEvent) {
        println!("{}", self.render(ev));
    }
}

pub struct JsonOutput {
    opts: OutputOptions,
    sink: Arc<Mutex<JsonSink>>,
}

impl JsonOutput {
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            opts,
            sink: Arc::new(Mutex::new(JsonSink {
                timestamps: opts.json_timestamps,
                start: Instant::now(),
            })),
        }
    }

    pub(crate) fn render_event_json(&self, ev: JsonEvent) -> String {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .render(ev)
    }

    fn json_event(&self, ev: JsonEvent) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(ev);
    }

    fn error_event(&self, code: i32, msg: &str) {
        self.json_event(error_to_json(code, msg));

        if self.opts.verbose {
            eprintln!("error: {msg}");
        }
    }
}

impl Presenter for JsonOutput {
    fn open(&self, mut config: PresenterConfig) -> Arc<dyn PresenterController> {
        let dialog = Dialog::new(&mut config);
        self.json_event(open_to_json(&config));
        Arc::new(JsonProgress {
            sink: self.sink.clone(),
            dialog,
            last_percent: Mutex::new(None),
        })
    }
}

impl Notifier for JsonOutput {
    fn show(&self, level: NoticeLevel, title: &str, message: &str) {
        self.json_event(notice_to_json(level, title, message));
    }
}

impl Reporter for JsonOutput {
    fn emit(&self, event: Event) {
        match event {
            Event::Ports(ports) => self.json_event(list_to_json(&ports)),
            Event::Outcome { kind, outcome } => self.json_event(outcome_to_json(kind, &outcome)),
            Event::Error { code, message } => self.error_event(code, &message),
            Event::Hint(hint) => {
                self.json_event(JsonEvent::status("hint").with_str("message", &hint));
            }
        }
    }

    fn finish(&self) {}
}

struct JsonProgress {
    sink: Arc<Mutex<JsonSink>>,
    dialog: Dialog,
    last_percent: Mutex<Option<u64>>,
}

impl JsonProgress {
    fn write(&self, ev: JsonEvent) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(ev);
    }
}

impl PresenterController for JsonProgress {
    fn update_progress(&self, value: f64) {
        if self.dialog.is_closed() {
            return;
        }
        // Whole percents only.
        let pct = percent(value);
        {
            let mut last = self
                .last_percent
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last == Some(pct) {
                return;
            }
            *last = Some(pct);
        }
        self.write(JsonEvent::status("progress").with_u64("percent", pct));
    }

    fn set_message(&self, message: &str) {
        if !self.dialog.is_closed() {
            self.write(JsonEvent::status("message").with_str("message", message));
        }
    }

    fn complete(&self) {
        if self.dialog.close(true) {
            self.write(JsonEvent::status("complete"));
        }
    }

    fn cancel(&self) {
        if self.dialog.close(false) {
            self.write(JsonEvent::status("cancel"));
        }
    }
}

pub fn open_to_json(config: &PresenterConfig) -> JsonEvent {
    JsonEvent::status("open")
        .with_str("title", &config.title)
        .with_str("message", &config.message)
        .with_bool("cancelable", config.cancelable)
        .with_u64("percent", percent(config.initial_progress))
}

pub fn notice_to_json(level: NoticeLevel, title: &str, message: &str) -> JsonEvent {
    JsonEvent::status("notice")
        .with_value(
            "level",
            serde_json::to_value(level).unwrap_or(serde_json::Value::Null),
        )
        .with_str("title", title)
        .with_str("message", message)
}

pub fn error_to_json(code: i32, message: &str) -> JsonEvent {
    JsonEvent::status("error")
        .with_i64("code", code as i64)
        .with_str("message", message)
}

pub fn list_to_json(ports: &[DevicePort]) -> JsonEvent {
    JsonEvent::status("list")
        .with_u64("count", ports.len() as u64)
        .with_value(
            "ports",
            serde_json::Value::Array(
                ports
                    .iter()
                    .enumerate()
                    .map(|(i, p)| port_to_value(i, p))
                    .collect(),
            ),
        )
}

pub fn outcome_to_json(kind: OperationKind, outcome: &OperationOutcome) -> JsonEvent {
    let ev = JsonEvent::status("outcome").with_value(
        "operation",
        serde_json::to_value(kind).unwrap_or(serde_json::Value::Null),
    );
    match outcome {
        OperationOutcome::Succeeded { message } => ev
            .with_str("result", "succeeded")
            .with_str("message", message),
        OperationOutcome::Failed { message, origin } => ev
            .with_str("result", "failed")
            .with_str("message", message)
            .with_value(
                "origin",
                serde_json::to_value(origin).unwrap_or(serde_json::Value::Null),
            ),
        OperationOutcome::Cancelled => ev.with_str("result", "cancelled"),
    }
}
