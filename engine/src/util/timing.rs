use std::borrow::Cow;
use std::time::Instant;

use log::{self, Level};

/// Logs the elapsed wall time of a scope when dropped.
///
/// Used around the planner pre-pass and forced-completion drains, where a
/// single call can span a lot of work.
pub struct ScopedTimer {
    label: Option<Cow<'static, str>>,
    level: Level,
    start: Option<Instant>,
}

impl ScopedTimer {
    pub fn with_level(label: impl Into<Cow<'static, str>>, level: Level) -> Self {
        Self {
            label: Some(label.into()),
            level,
            start: Some(Instant::now()),
        }
    }

    pub fn info(label: impl Into<Cow<'static, str>>) -> Self {
        Self::with_level(label, Level::Info)
    }

    pub fn debug(label: impl Into<Cow<'static, str>>) -> Self {
        Self::with_level(label, Level::Debug)
    }

    /// Build the label only if debug logging is actually enabled.
    pub fn debug_lazy<F>(label_gen: F) -> Self
    where
        F: FnOnce() -> String,
    {
        if log::log_enabled!(Level::Debug) {
            Self {
                label: Some(Cow::Owned(label_gen())),
                level: Level::Debug,
                start: Some(Instant::now()),
            }
        } else {
            Self {
                label: None,
                level: Level::Debug,
                start: None,
            }
        }
    }

    pub fn finish(mut self) {
        self.report();
    }

    fn report(&mut self) {
        if let (Some(label), Some(start)) = (self.label.take(), self.start.take()) {
            log::log!(self.level, "{}: {:.3?}", label, start.elapsed());
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.report();
    }
}
