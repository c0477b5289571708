//! Logical playback clock
//!
//! Either running (anchored to a wall-clock instant) or stopped (holding a
//! position). Runs at the playback speed; negative speed runs backwards and
//! clamps at zero. Owned by the Controller thread, so no atomics.
//!
//! The `_at(now)` variants take the instant explicitly for tests.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct Timer {
    /// Instant at which `position_ms` was current (None = stopped)
    anchor: Option<Instant>,
    position_ms: f64,
    speed: f64,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self { anchor: None, position_ms: 0.0, speed: 1.0 }
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn position_ms(&self) -> f64 {
        self.position_at(Instant::now())
    }

    pub fn position_at(&self, now: Instant) -> f64 {
        match self.anchor {
            Some(anchor) => {
                let elapsed = now.saturating_duration_since(anchor).as_micros() as f64 / 1000.0;
                (self.position_ms + elapsed * self.speed).max(0.0)
            }
            None => self.position_ms,
        }
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        if self.anchor.is_none() {
            self.anchor = Some(now);
        }
    }

    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    /// Freeze at the current position
    pub fn stop_at(&mut self, now: Instant) {
        self.position_ms = self.position_at(now);
        self.anchor = None;
    }

    /// Jump to `ms`, keeping the running state
    pub fn set_position(&mut self, ms: f64) {
        self.set_position_at(ms, Instant::now());
    }

    pub fn set_position_at(&mut self, ms: f64, now: Instant) {
        self.position_ms = ms.max(0.0);
        if self.anchor.is_some() {
            self.anchor = Some(now);
        }
    }

    /// Change rate without a position jump
    pub fn set_speed(&mut self, speed: f64) {
        self.set_speed_at(speed, Instant::now());
    }

    pub fn set_speed_at(&mut self, speed: f64, now: Instant) {
        if self.anchor.is_some() {
            self.position_ms = self.position_at(now);
            self.anchor = Some(now);
        }
        self.speed = speed;
    }

    /// Stop and return to zero at normal speed (new video)
    pub fn reset(&mut self) {
        *self = Self { speed: self.speed, ..Self::new() };
    }
}
