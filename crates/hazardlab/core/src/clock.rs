// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Simulation clock
//!
//! All timestamps in the engine are microsecond offsets from the moment the
//! clock was created, so records from different runs compare cleanly.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Microseconds elapsed since the simulation clock was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_duration(offset: Duration) -> Self {
        Self(u64::try_from(offset.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.0)
    }

    /// Time between `earlier` and `self`, zero if `earlier` is later
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.0 as f64 / 1000.0)
    }
}

/// Process-wide monotonic time source, read-only after creation
#[derive(Debug, Clone, Copy)]
pub struct SimulationClock {
    origin: Instant,
}

impl SimulationClock {
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.origin.elapsed())
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Convert a wall instant into the simulation timeline
    pub fn timestamp_of(&self, instant: Instant) -> Timestamp {
        Timestamp::from_duration(instant.saturating_duration_since(self.origin))
    }
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = SimulationClock::start();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let second = clock.now();
        assert!(second > first);
        assert!(second.saturating_since(first) >= Duration::from_millis(2));
    }

    #[test]
    fn test_saturating_since() {
        let early = Timestamp(1_000);
        let late = Timestamp(4_500);
        assert_eq!(late.saturating_since(early), Duration::from_micros(3_500));
        assert_eq!(early.saturating_since(late), Duration::ZERO);
    }
}
