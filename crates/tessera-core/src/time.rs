use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A point in time as float seconds since the Unix epoch.
///
/// This is the wire representation used throughout the API: event `time`,
/// `endTime`, tracking fields and deletion markers are all float seconds.
/// Sub-millisecond precision is not guaranteed and not relied upon.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Sentinel for records whose real creation time was never recorded,
    /// e.g. built-in system streams.
    pub const UNKNOWN: Timestamp = Timestamp(0.0);

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(elapsed.as_secs_f64())
    }

    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    pub const fn as_secs(self) -> f64 {
        self.0
    }

    pub fn add_secs(self, secs: f64) -> Self {
        Self(self.0 + secs)
    }

    pub fn sub_secs(self, secs: f64) -> Self {
        Self(self.0 - secs)
    }

    pub fn is_before(self, other: Timestamp) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<f64> for Timestamp {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for f64 {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_arithmetic() {
        let t = Timestamp::now();
        assert!(Timestamp::UNKNOWN.is_before(t));
        assert!(t.is_before(t.add_secs(1.0)));
        assert!(t.sub_secs(1.0).is_before(t));
    }

    #[test]
    fn serializes_as_bare_number() {
        let t = Timestamp::from_secs(1.5);
        assert_eq!(serde_json::to_string(&t).unwrap(), "1.5");
    }
}
