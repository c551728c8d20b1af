//! Wall-clock aligned discrete windows.
//!
//! Window boundaries are always `floor(epoch_seconds / W) * W`. They never depend on when an
//! individual snapshot arrived, so every (feature, key) pair with the same length shares the
//! same boundaries.

mod registry;

pub use registry::WindowRegistry;

use crate::feature::Feature;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use derive_more::Constructor;
use serde::{Deserialize, Serialize};

/// Pick the supported window length closest to `requested` (ties resolve to the shorter one).
pub fn normalize(feature: Feature, requested: i64) -> i64 {
    let supported = feature.supported_windows();
    supported
        .iter()
        .copied()
        .min_by_key(|candidate| candidate.abs_diff(requested))
        .unwrap_or_else(|| feature.default_window())
}

/// Align `now` down to the start of its window.
pub fn window_start(now: DateTime<Utc>, length_secs: i64) -> DateTime<Utc> {
    let length_secs = length_secs.max(1);
    let aligned = now.timestamp().div_euclid(length_secs) * length_secs;
    DateTime::from_timestamp(aligned, 0).unwrap_or(now)
}

/// Half-open window `[start, end)` attached to snapshots and results.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Constructor)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub length_secs: i64,
}

impl WindowBounds {
    /// Bounds of the window containing `now`.
    pub fn aligned(now: DateTime<Utc>, length_secs: i64) -> Self {
        Self::starting_at(window_start(now, length_secs), length_secs)
    }

    pub fn starting_at(start: DateTime<Utc>, length_secs: i64) -> Self {
        Self {
            start,
            end: start + ChronoDuration::seconds(length_secs),
            length_secs,
        }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }
}

/// Mutable window tracking for one (feature, key).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowState {
    length_secs: i64,
    current_start: Option<DateTime<Utc>>,
    previous_start: Option<DateTime<Utc>>,
    has_completed_window: bool,
}

impl WindowState {
    pub fn new(length_secs: i64) -> Self {
        Self {
            length_secs: length_secs.max(1),
            current_start: None,
            previous_start: None,
            has_completed_window: false,
        }
    }

    pub fn length_secs(&self) -> i64 {
        self.length_secs
    }

    pub fn current_start(&self) -> Option<DateTime<Utc>> {
        self.current_start
    }

    pub fn has_completed_window(&self) -> bool {
        self.has_completed_window
    }

    /// Move the state to the window containing `now`.
    ///
    /// Returns true when a new window started. The very first observation opens a window but
    /// does not complete one. Observations older than the current window are ignored.
    pub fn check_and_advance(&mut self, now: DateTime<Utc>) -> bool {
        let start = window_start(now, self.length_secs);

        match self.current_start {
            None => {
                self.current_start = Some(start);
                true
            }
            Some(current) if start > current => {
                self.previous_start = Some(current);
                self.current_start = Some(start);
                self.has_completed_window = true;
                true
            }
            Some(current) => {
                if start < current {
                    tracing::debug!(
                        %current,
                        observed = %now,
                        "observation precedes current window, ignoring for rollover"
                    );
                }
                false
            }
        }
    }

    /// Reset to a new length; no window is open and none has completed afterwards.
    pub fn reconfigure(&mut self, length_secs: i64) {
        *self = Self::new(length_secs);
    }

    /// Bounds of the currently open window.
    pub fn current_bounds(&self) -> Option<WindowBounds> {
        self.current_start
            .map(|start| WindowBounds::starting_at(start, self.length_secs))
    }

    /// Bounds of the window most recently closed by [`Self::check_and_advance`].
    pub fn completed_bounds(&self) -> Option<WindowBounds> {
        if !self.has_completed_window {
            return None;
        }
        self.previous_start
            .map(|start| WindowBounds::starting_at(start, self.length_secs))
    }
}
