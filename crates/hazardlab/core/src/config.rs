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

// Simulation configuration options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HazardError, HazardResult};
use crate::types::ActorId;

/// Order in which the arbiter serves pending requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationPolicy {
    /// First come, first served
    #[default]
    Fifo,
    /// Highest priority first, FIFO among equals
    Priority,
    /// Priority that grows with time spent waiting
    PriorityAging,
}

/// Whether compound read-modify-write operations run under exclusive access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Guarded,
    Unguarded,
}

/// How the monitor picks the member of a deadlock cycle to sacrifice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VictimPolicy {
    #[default]
    LowestPriority,
    MostRecentlyBlocked,
}

/// Inclusive range of milliseconds used for jittered delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

impl DelayRange {
    pub fn fixed(ms: u64) -> Self {
        Self { min: ms, max: ms }
    }

    pub fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max)
    }
}

/// Simulation configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Arbiter allocation policy
    pub policy: AllocationPolicy,
    /// Execution mode of engine operations
    pub mode: ExecutionMode,
    /// Effective priority gained per second of waiting under `PriorityAging`
    pub aging_rate: f64,
    /// How long a wait-for cycle must persist before it is a confirmed deadlock
    pub deadlock_recheck_window_ms: u64,
    /// Time without progress after which a retrying group is livelocked
    pub livelock_threshold_ms: u64,
    /// Wait time after which a single actor is starving
    pub starvation_threshold_ms: u64,
    /// Requested cadence of the hazard monitor, capped by `monitor_cadence`
    pub sampling_interval_ms: u64,
    /// Deadline of a blocking acquire
    pub acquire_timeout_ms: u64,
    /// Retries allowed per operation before the actor gives up on it
    pub max_retries: u32,
    /// Wall time budget of a run
    pub run_duration_ms: u64,
    /// Seed of every pseudo-random delay
    pub seed: u64,
    /// Simulated processing delay between the read and the write phase
    pub processing_delay_ms: DelayRange,
    /// Backoff between retries of polite workloads
    pub backoff_ms: DelayRange,
    /// Break confirmed deadlocks by victimizing one member of the cycle
    pub resolve_deadlocks: bool,
    /// Victim selection for deadlock resolution
    pub victim_policy: VictimPolicy,
    /// Explicit livelock watch groups; empty watches all unfinished actors as one group
    pub livelock_groups: Vec<Vec<ActorId>>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            policy: AllocationPolicy::Fifo,
            mode: ExecutionMode::Guarded,
            aging_rate: 50.0,
            deadlock_recheck_window_ms: 200,
            livelock_threshold_ms: 1000,
            starvation_threshold_ms: 1000,
            sampling_interval_ms: 20,
            acquire_timeout_ms: 5000,
            max_retries: 3,
            run_duration_ms: 3000,
            seed: 0x5eed,
            processing_delay_ms: DelayRange { min: 1, max: 5 },
            backoff_ms: DelayRange { min: 10, max: 30 },
            resolve_deadlocks: false,
            victim_policy: VictimPolicy::LowestPriority,
            livelock_groups: Vec::new(),
        }
    }
}

impl SimulationConfig {
    pub fn deadlock_recheck_window(&self) -> Duration {
        Duration::from_millis(self.deadlock_recheck_window_ms)
    }

    pub fn livelock_threshold(&self) -> Duration {
        Duration::from_millis(self.livelock_threshold_ms)
    }

    pub fn starvation_threshold(&self) -> Duration {
        Duration::from_millis(self.starvation_threshold_ms)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    /// Effective sampling period of the monitor
    ///
    /// Never longer than half the deadlock recheck window, so a cycle is
    /// first sighted within half a window of forming and confirmed within two
    /// windows. Floored at 1ms.
    pub fn monitor_cadence(&self) -> Duration {
        let half_window = Duration::from_micros(self.deadlock_recheck_window_ms.saturating_mul(500));
        self.sampling_interval().min(half_window).max(Duration::from_millis(1))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }

    /// Reject configurations the engine cannot run meaningfully
    pub fn validate(&self) -> HazardResult<()> {
        if self.sampling_interval_ms == 0 {
            return Err(HazardError::InvalidConfig("sampling_interval_ms must be positive".to_string()));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(HazardError::InvalidConfig("acquire_timeout_ms must be positive".to_string()));
        }
        if !self.aging_rate.is_finite() || self.aging_rate < 0.0 {
            return Err(HazardError::InvalidConfig(format!("aging_rate must be a non-negative number, got {}", self.aging_rate)));
        }
        for (name, range) in [("processing_delay_ms", self.processing_delay_ms), ("backoff_ms", self.backoff_ms)] {
            if range.min > range.max {
                return Err(HazardError::InvalidConfig(format!("{name}: min {} exceeds max {}", range.min, range.max)));
            }
        }
        if self.livelock_groups.iter().any(|group| group.len() < 2) {
            return Err(HazardError::InvalidConfig("livelock groups need at least two actors".to_string()));
        }
        Ok(())
    }
}
