use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of microseconds in one second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A wall-clock instant with microsecond resolution, captured when the
/// multiplexer reports readiness and handed to every read callback.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros_since_epoch: i64,
}

impl Timestamp {
    /// Capture the current wall-clock time.
    pub fn now() -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp {
            micros_since_epoch: micros,
        }
    }

    /// Microseconds since the unix epoch.
    pub fn micros_since_epoch(&self) -> i64 {
        self.micros_since_epoch
    }

    /// Whether this timestamp holds a real instant rather than the default.
    pub fn is_valid(&self) -> bool {
        self.micros_since_epoch > 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.micros_since_epoch / MICROS_PER_SECOND;
        let micros = self.micros_since_epoch % MICROS_PER_SECOND;
        write!(f, "{}.{:06}", seconds, micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_valid_and_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn test_display_pads_micros() {
        let ts = Timestamp {
            micros_since_epoch: 3 * MICROS_PER_SECOND + 42,
        };
        assert_eq!(ts.to_string(), "3.000042");
    }

    #[test]
    fn test_default_is_invalid() {
        assert!(!Timestamp::default().is_valid());
    }
}
