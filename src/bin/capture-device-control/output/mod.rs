use std::sync::{Arc, Mutex, PoisonError};

use capture_device_control::backend::ports::DevicePort;
use capture_device_control::operation::{OperationKind, OperationOutcome};
use capture_device_control::presenter::{Callback, Notifier, Presenter, PresenterConfig};

use crate::cli;

pub mod human;
pub mod json;


#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub verbose: bool,
    pub quiet: bool,
    pub json_timestamps: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    Ports(Vec<DevicePort>),
    Outcome {
        kind: OperationKind,
        outcome: OperationOutcome,
    },
    Error {
        code: i32,
        message: String,
    },
    Hint(String),
}

pub trait Reporter: Send + Sync {
    fn emit(&self, event: Event);
    fn finish(&self);
}

/// One console sink seen through the three roles the commands need.
pub struct Output {
    pub presenter: Arc<dyn Presenter>,
    pub notifier: Arc<dyn Notifier>,
    pub reporter: Arc<dyn Reporter>,
}

impl Output {
    fn from_sink<T>(sink: Arc<T>) -> Self
    where
        T: Presenter + Notifier + Reporter + 'static,
    {
        Self {
            presenter: sink.clone(),
            notifier: sink.clone(),
            reporter: sink,
        }
    }
}

pub fn make(args: &cli::OutputArgs) -> Output {
    let opts = OutputOptions {
        verbose: args.verbose,
        quiet: args.quiet,
        json_timestamps: args.json_timestamps,
    };
    if args.json {
        Output::from_sink(Arc::new(json::JsonOutput::new(opts)))
    } else {
        Output::from_sink(Arc::new(human::HumanOutput::new(opts)))
    }
}

pub fn make_for_list(args: &cli::ListArgs) -> Output {
    make(&cli::OutputArgs {
        json: args.json,
        json_timestamps: false,
        quiet: false,
        verbose: false,
    })
}

struct DialogState {
    closed: bool,
    on_complete: Option<Callback>,
    on_cancel: Option<Callback>,
}

/// Open/closed bookkeeping shared by the progress presenters.
pub struct Dialog {
    state: Mutex<DialogState>,
}

impl Dialog {
    pub fn new(config: &mut PresenterConfig) -> Self {
        Self {
            state: Mutex::new(DialogState {
                closed: false,
                on_complete: config.on_complete.take(),
                on_cancel: config.on_cancel.take(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Closes the dialog and runs the matching callback. Returns false if it
    /// was already closed.
    pub fn close(&self, completed: bool) -> bool {
        let cb = {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if st.closed {
                return false;
            }
            st.closed = true;
            let cb = if completed {
                st.on_complete.take()
            } else {
                st.on_cancel.take()
            };
            st.on_complete = None;
            st.on_cancel = None;
            cb
        };
        if let Some(cb) = cb {
            cb();
        }
        true
    }
}

pub fn percent(value: f64) -> u64 {
    value.clamp(0.0, 100.0).floor() as u64
}

pub fn format_port_line(index: usize, p: &DevicePort) -> String {
    format!(
        "[{index}] {} {:04X}:{:04X} {}",
        p.port_name,
        p.vid,
        p.pid,
        p.product.as_deref().unwrap_or("")
    )
}

pub fn port_to_value(index: usize, p: &DevicePort) -> serde_json::Value {
    let mut v = serde_json::to_value(p)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(obj) = &mut v {
        obj.insert("index".to_string(), serde_json::Value::from(index as u64));
    }
    v
}
