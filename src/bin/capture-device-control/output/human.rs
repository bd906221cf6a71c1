use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use capture_device_control::backend::ports::{ESP32_S3_PID, ESP32_S3_VID};
use capture_device_control::operation::OperationOutcome;
use capture_device_control::presenter::{
    NoticeLevel, Notifier, Presenter, PresenterConfig, PresenterController,
};

use crate::output::{format_port_line, percent, Dialog, Event, OutputOptions, Reporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Quiet,
    Verbose,
    Progress,
}

struct Console {
    is_tty: bool,
    progress_active: bool,
}

impl Console {
    fn finish_line(&mut self) {
        if self.progress_active {
            eprintln!();
            self.progress_active = false;
        }
    }

    fn println(&mut self, msg: &str) {
        self.finish_line();
        eprintln!("{msg}");
    }
}

pub struct HumanOutput {
    opts: OutputOptions,
    console: Arc<Mutex<Console>>,
}

impl HumanOutput {
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            opts,
            console: Arc::new(Mutex::new(Console {
                is_tty: std::io::stderr().is_terminal(),
                progress_active: false,
            })),
        }
    }

    fn mode(&self) -> Mode {
        mode_of(&self.opts)
    }

    fn console(&self) -> MutexGuard<'_, Console> {
        self.console.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn println(&self, msg: &str) {
        if self.mode() == Mode::Quiet {
            return;
        }
        self.console().println(msg);
    }

    pub(crate) fn notice_line(level: NoticeLevel, title: &str, message: &str) -> String {
        let tag = match level {
            NoticeLevel::Success => "ok",
            NoticeLevel::Error => "error",
            NoticeLevel::Warning => "warning",
            NoticeLevel::Info => "info",
        };
        format!("{tag}: {title}: {message}")
    }
}

fn mode_of(opts: &OutputOptions) -> Mode {
    if opts.quiet {
        Mode::Quiet
    } else if opts.verbose {
        Mode::Verbose
    } else {
        Mode::Progress
    }
}

impl Presenter for HumanOutput {
    fn open(&self, mut config: PresenterConfig) -> Arc<dyn PresenterController> {
        let dialog = Dialog::new(&mut config);
        self.println(&config.title);
        self.println(&format!("  {}", config.message));
        if config.cancelable && self.mode() != Mode::Quiet {
            self.println("  (press Ctrl-C to cancel)");
        }

        Arc::new(HumanProgress {
            mode: self.mode(),
            console: self.console.clone(),
            dialog,
            last_percent: Mutex::new(None),
        })
    }
}

impl Notifier for HumanOutput {
    fn show(&self, level: NoticeLevel, title: &str, message: &str) {
        let line = Self::notice_line(level, title, message);
        if level == NoticeLevel::Error {
            self.console().println(&line);
        } else {
            self.println(&line);
        }
    }
}

impl Reporter for HumanOutput {
    fn emit(&self, event: Event) {
        match event {
            Event::Ports(ports) => {
                if ports.is_empty() {
                    self.println(&format!(
                        "No devices found (ESP32-S3 {ESP32_S3_VID:04X}:{ESP32_S3_PID:04X})"
                    ));
                }
                for (i, p) in ports.iter().enumerate() {
                    self.println(&format_port_line(i, p));
                }
            }
            Event::Outcome { kind, outcome } => {
                if outcome == OperationOutcome::Cancelled {
                    self.println(&format!("{kind} cancelled"));
                }
            }
            Event::Error { code: _, message } => {
                self.console().println(&format!("error: {message}"));
            }
            Event::Hint(hint) => self.println(&hint),
        }
    }

    fn finish(&self) {
        self.console().finish_line();
    }
}

struct HumanProgress {
    mode: Mode,
    console: Arc<Mutex<Console>>,
    dialog: Dialog,
    last_percent: Mutex<Option<u64>>,
}

impl HumanProgress {
    fn console(&self) -> MutexGuard<'_, Console> {
        self.console.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PresenterController for HumanProgress {
    fn update_progress(&self, value: f64) {
        if self.mode != Mode::Progress || self.dialog.is_closed() {
            return;
        }
        let pct = percent(value);
        let mut last = self.last_percent.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == Some(pct) {
            return;
        }

        let mut console = self.console();
        if console.is_tty {
            eprint!("\r  progress {pct:3}%");
            let _ = std::io::stderr().flush();
            console.progress_active = true;
            *last = Some(pct);
            return;
        }

        let prev = last.unwrap_or(0);
        if pct == 0 || pct == 100 || pct >= prev + 10 {
            *last = Some(pct);
            console.println(&format!("  progress {pct:3}%"));
        }
    }

    fn set_message(&self, message: &str) {
        if self.mode == Mode::Verbose && !self.dialog.is_closed() {
            self.console().println(&format!("  {message}"));
        }
    }

    fn complete(&self) {
        if self.dialog.close(true) {
            self.console().finish_line();
        }
    }

    fn cancel(&self) {
        if self.dialog.close(false) {
            self.console().finish_line();
        }
    }
}
