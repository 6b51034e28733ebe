//! Adaptive pacing of sync cycles.
//!
//! ```text
//!   range = max - min
//!
//!   local edit this cycle    interval -= range × 0.50
//!   remote edit this cycle   interval -= range × 0.25
//!   quiet cycle              interval += range × 0.03
//!   hook (focus/blur)        interval ± …
//!   clamp                    min ≤ interval ≤ max
//! ```
//!
//! Busy documents converge within a couple of cycles; an idle session
//! drifts back to `max` in roughly thirty quiet cycles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;

pub const LOCAL_CHANGE_STEP: f64 = 0.5;
pub const REMOTE_CHANGE_STEP: f64 = 0.25;
pub const IDLE_STEP: f64 = 0.03;
pub const FOCUS_STEP: f64 = 0.75;
pub const BLUR_STEP: f64 = 0.5;

/// Min / starting / max interval in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub min: u64,
    pub normal: u64,
    pub max: u64,
}

impl SpeedProfile {
    pub const SLOW: Self = Self {
        min: 800,
        normal: 1000,
        max: 2000,
    };
    pub const NORMAL: Self = Self {
        min: 400,
        normal: 700,
        max: 1500,
    };
    pub const FAST: Self = Self {
        min: 200,
        normal: 400,
        max: 800,
    };

    /// Preset by name: `slow`, `normal` or `fast`.
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "slow" => Some(Self::SLOW),
            "normal" => Some(Self::NORMAL),
            "fast" => Some(Self::FAST),
            _ => None,
        }
    }
}

/// Adjusts the interval before it is clamped.
pub trait IntervalHook: Send + Sync {
    /// A shared document gained or lost focus.
    fn note_focus(&mut self, focused: bool);

    /// Return the adjusted interval (ms) given the unclamped one and the range.
    fn adjust(&mut self, interval: f64, range: f64) -> f64;
}

/// Speeds up right after a document is focused, backs off after a blur.
#[derive(Debug, Default, Clone)]
pub struct FocusBoost {
    focused: bool,
    blurred: bool,
}

impl IntervalHook for FocusBoost {
    fn note_focus(&mut self, focused: bool) {
        if focused {
            self.focused = true;
        } else {
            self.blurred = true;
        }
    }

    fn adjust(&mut self, mut interval: f64, range: f64) -> f64 {
        if std::mem::take(&mut self.focused) {
            interval -= range * FOCUS_STEP;
        }
        if std::mem::take(&mut self.blurred) {
            interval += range * BLUR_STEP;
        }
        interval
    }
}

/// Current interval plus its bounds.
pub struct IntervalController {
    min: f64,
    max: f64,
    current: f64,
    immediate: bool,
    hook: Option<Box<dyn IntervalHook>>,
}

impl IntervalController {
    pub fn new(profile: SpeedProfile) -> Self {
        let min = profile.min as f64;
        let max = (profile.max as f64).max(min);
        Self {
            min,
            max,
            current: (profile.normal as f64).clamp(min, max),
            immediate: false,
            hook: Some(Box::new(FocusBoost::default())),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.speed_profile())
    }

    pub fn with_hook(mut self, hook: Option<Box<dyn IntervalHook>>) -> Self {
        self.hook = hook;
        self
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current.round() as u64)
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min as u64),
            Duration::from_millis(self.max as u64),
        )
    }

    /// Swap in new bounds; the interval restarts at `profile.normal`.
    pub fn set_profile(&mut self, profile: SpeedProfile) {
        let hook = self.hook.take();
        *self = Self::new(profile).with_hook(hook);
    }

    pub fn note_focus(&mut self, focused: bool) {
        if let Some(hook) = self.hook.as_mut() {
            hook.note_focus(focused);
        }
    }

    /// Run the next cycle at the minimum interval.
    pub fn request_immediate(&mut self) {
        self.immediate = true;
    }

    /// Fold one cycle's activity into the interval.
    pub fn recompute(&mut self, local_change: bool, remote_change: bool) -> Duration {
        let range = self.max - self.min;
        let mut interval = self.current;

        if local_change {
            interval -= range * LOCAL_CHANGE_STEP;
        }
        if remote_change {
            interval -= range * REMOTE_CHANGE_STEP;
        }
        if !local_change && !remote_change {
            interval += range * IDLE_STEP;
        }
        if let Some(hook) = self.hook.as_mut() {
            interval = hook.adjust(interval, range);
        }
        if std::mem::take(&mut self.immediate) {
            interval = self.min;
        }

        self.current = interval.clamp(self.min, self.max);
        self.current()
    }
}

impl std::fmt::Debug for IntervalController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalController")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("current", &self.current)
            .finish()
    }
}
