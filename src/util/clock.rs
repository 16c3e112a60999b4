//! Scheduler time sources.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Which time the scheduler measures sleeps and timeouts against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Simulated time. When nothing is runnable the clock jumps to the next
    /// deadline, so runs are deterministic and instantaneous.
    #[default]
    Virtual,
    /// Real elapsed time. Idle periods block the calling thread.
    Wall,
}

impl fmt::Display for ClockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Virtual => "virtual",
            Self::Wall => "wall",
        })
    }
}

impl FromStr for ClockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtual" => Ok(Self::Virtual),
            "wall" => Ok(Self::Wall),
            other => Err(format!("unknown clock mode `{other}`, expected `virtual` or `wall`")),
        }
    }
}

/// Monotonic scheduler clock, measured from its creation.
#[derive(Debug, Clone)]
pub struct Clock {
    mode: ClockMode,
    origin: Instant,
    simulated: Duration,
}

impl Clock {
    /// Clock starting at zero.
    #[must_use]
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            origin: Instant::now(),
            simulated: Duration::ZERO,
        }
    }

    /// Time source in use.
    #[must_use]
    pub const fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Time since the clock started.
    #[must_use]
    pub fn now(&self) -> Duration {
        match self.mode {
            ClockMode::Virtual => self.simulated,
            ClockMode::Wall => self.origin.elapsed(),
        }
    }

    /// Move time forward to `deadline`. Virtual clocks jump; wall clocks
    /// sleep until it passes. Never moves backwards.
    pub fn advance_to(&mut self, deadline: Duration) {
        match self.mode {
            ClockMode::Virtual => self.simulated = self.simulated.max(deadline),
            ClockMode::Wall => {
                let now = self.origin.elapsed();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_jumps() {
        let mut clock = Clock::new(ClockMode::Virtual);
        clock.advance_to(Duration::from_secs(3600));
        assert_eq!(clock.now(), Duration::from_secs(3600));
        clock.advance_to(Duration::from_secs(10));
        assert_eq!(clock.now(), Duration::from_secs(3600));
    }

    #[test]
    fn test_wall_clock_sleeps() {
        let mut clock = Clock::new(ClockMode::Wall);
        clock.advance_to(Duration::from_millis(20));
        assert!(clock.now() >= Duration::from_millis(20));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("Wall".parse::<ClockMode>().unwrap(), ClockMode::Wall);
        assert!("sundial".parse::<ClockMode>().is_err());
    }
}
