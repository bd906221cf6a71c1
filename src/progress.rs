use std::time::Duration;

use crate::operation::OperationKind;

pub const PROGRESS_MAX: f64 = 100.0;

/// Synthetic progress curve used while real events are sparse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampProfile {
    /// Increment applied per tick.
    pub step: f64,
    /// The ramp never advances past this value.
    pub ceiling: f64,
    pub tick: Duration,
}

impl RampProfile {
    pub fn for_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Restart => Self {
                step: 0.5,
                ceiling: 85.0,
                tick: Duration::from_millis(100),
            },
            OperationKind::FlashFirmware => Self {
                step: 0.2,
                ceiling: 95.0,
                tick: Duration::from_millis(100),
            },
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Next ramp value from `current`, or `None` once the ceiling is reached.
    pub fn next(&self, current: f64) -> Option<f64> {
        if !current.is_finite() || current >= self.ceiling {
            return None;
        }
        Some((current.max(0.0) + self.step).min(self.ceiling))
    }
}

pub fn merge(last_real: f64, last_ramp: f64) -> f64 {
    last_real.max(last_ramp)
}

fn clamp(value: f64) -> f64 {
    value.clamp(0.0, PROGRESS_MAX)
}

/// Per-session progress record. `displayed` never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressTrack {
    pub last_real: f64,
    pub last_ramp: f64,
    pub displayed: f64,
}

impl ProgressTrack {
    pub fn new(initial: f64) -> Self {
        let initial = if initial.is_finite() { clamp(initial) } else { 0.0 };
        Self {
            last_real: initial,
            last_ramp: initial,
            displayed: initial,
        }
    }

    /// Records a backend reading. Returns the new displayed value if it moved.
    pub fn observe_real(&mut self, progress: f64) -> Option<f64> {
        if !progress.is_finite() {
            return None;
        }
        self.last_real = clamp(progress);
        self.raise()
    }

    /// Advances the ramp from the displayed value. Returns the new displayed
    /// value if it moved.
    pub fn tick(&mut self, profile: &RampProfile) -> Option<f64> {
        let next = profile.next(self.displayed)?;
        if next > self.last_ramp {
            self.last_ramp = next;
        }
        self.raise()
    }

    pub fn finish(&mut self) -> f64 {
        self.last_real = PROGRESS_MAX;
        self.displayed = PROGRESS_MAX;
        self.displayed
    }

    fn raise(&mut self) -> Option<f64> {
        let candidate = merge(self.last_real, self.last_ramp);
        if candidate > self.displayed {
            self.displayed = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}
