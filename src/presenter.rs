//! Capability traits the coordinator drives. Rendering lives elsewhere.

use std::fmt;
use std::sync::Arc;

use crate::progress::RampProfile;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

pub struct PresenterConfig {
    pub title: String,
    pub message: String,
    pub cancelable: bool,
    pub initial_progress: f64,
    /// The coordinator ticks this itself; presenters must not.
    pub ramp: RampProfile,
    pub on_complete: Option<Callback>,
    pub on_cancel: Option<Callback>,
}

impl fmt::Debug for PresenterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenterConfig")
            .field("title", &self.title)
            .field("message", &self.message)
            .field("cancelable", &self.cancelable)
            .field("initial_progress", &self.initial_progress)
            .field("ramp", &self.ramp)
            .finish_non_exhaustive()
    }
}

/// A progress surface that can be opened once per session.
pub trait Presenter: Send + Sync {
    fn open(&self, config: PresenterConfig) -> Arc<dyn PresenterController>;
}

pub trait PresenterController: Send + Sync {
    /// Values outside `[0, 100]` are clamped by the presenter.
    fn update_progress(&self, value: f64);

    fn set_message(&self, message: &str);

    /// Closes the surface and runs `on_complete` unless already closed.
    fn complete(&self);

    /// Closes the surface and runs `on_cancel` unless already completed.
    fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Error,
    Warning,
    Info,
}

impl NoticeLevel {
    pub fn default_title(self) -> &'static str {
        match self {
            NoticeLevel::Success => "Success",
            NoticeLevel::Error => "Error",
            NoticeLevel::Warning => "Warning",
            NoticeLevel::Info => "Info",
        }
    }
}

/// Fire-and-forget toasts.
pub trait Notifier: Send + Sync {
    fn show(&self, level: NoticeLevel, title: &str, message: &str);

    fn success(&self, message: &str, title: Option<&str>) {
        let level = NoticeLevel::Success;
        self.show(level, title.unwrap_or(level.default_title()), message);
    }

    fn error(&self, message: &str, title: Option<&str>) {
        let level = NoticeLevel::Error;
        self.show(level, title.unwrap_or(level.default_title()), message);
    }

    fn warning(&self, message: &str, title: Option<&str>) {
        let level = NoticeLevel::Warning;
        self.show(level, title.unwrap_or(level.default_title()), message);
    }

    fn info(&self, message: &str, title: Option<&str>) {
        let level = NoticeLevel::Info;
        self.show(level, title.unwrap_or(level.default_title()), message);
    }
}
