use serde::{Deserialize, Serialize};
use std::fmt;

/// Presentation time of a captured sample on the capture clock, in seconds.
///
/// Sensor clocks are not anchored at zero, so a timestamp may be negative
/// or precede the writer's session origin.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Timestamp {
    seconds: f64,
}

impl Timestamp {
    pub fn from_seconds(s: f64) -> Self {
        Self { seconds: s }
    }

    pub fn from_millis(ms: f64) -> Self {
        Self::from_seconds(ms / 1000.0)
    }

    pub fn zero() -> Self {
        Self { seconds: 0.0 }
    }

    pub fn as_seconds(&self) -> f64 {
        self.seconds
    }

    /// Signed offset from `origin` in seconds.
    pub fn seconds_since(&self, origin: Timestamp) -> f64 {
        self.seconds - origin.seconds
    }

    /// Shift by `seconds`, which may be negative.
    pub fn offset(&self, seconds: f64) -> Timestamp {
        Timestamp::from_seconds(self.seconds + seconds)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::zero()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5}s", self.seconds)
    }
}
