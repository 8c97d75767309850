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

//! Injectable delay strategies
//!
//! The processing delay between read and write widens race windows; the
//! backoff delay spaces out polite retries. Randomness comes from a seeded
//! generator per actor so a run is reproducible regardless of how the
//! threads interleave.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::config::{DelayRange, SimulationConfig};
use crate::error::{HazardError, HazardResult};
use crate::types::ActorId;

/// Source of simulated processing and backoff delays
pub trait DelayStrategy: Send + Sync + fmt::Debug {
    /// Delay between the read and write phases of an operation
    ///
    /// An error aborts the operation mid-flight; the engine releases anything
    /// the actor holds before propagating it.
    fn processing_delay(&self, actor: ActorId) -> HazardResult<Duration>;

    /// Pause before a polite retry
    fn backoff(&self, actor: ActorId) -> Duration;
}

/// No delay at all
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl DelayStrategy for NoDelay {
    fn processing_delay(&self, _actor: ActorId) -> HazardResult<Duration> {
        Ok(Duration::ZERO)
    }

    fn backoff(&self, _actor: ActorId) -> Duration {
        Duration::ZERO
    }
}

/// Constant delays
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub processing: Duration,
    pub backoff: Duration,
}

impl DelayStrategy for FixedDelay {
    fn processing_delay(&self, _actor: ActorId) -> HazardResult<Duration> {
        Ok(self.processing)
    }

    fn backoff(&self, _actor: ActorId) -> Duration {
        self.backoff
    }
}

/// Uniform jitter drawn from one seeded stream per actor
pub struct SeededJitter {
    seed: u64,
    processing: DelayRange,
    backoff: DelayRange,
    streams: Mutex<BTreeMap<ActorId, StdRng>>,
}

impl SeededJitter {
    pub fn new(seed: u64, processing: DelayRange, backoff: DelayRange) -> Self {
        Self {
            seed,
            processing,
            backoff,
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.seed, config.processing_delay_ms, config.backoff_ms)
    }

    fn draw(&self, actor: ActorId, range: DelayRange) -> Duration {
        if range.min == range.max {
            return range.min_duration();
        }
        let mut streams = self.streams.lock();
        let rng = streams
            .entry(actor)
            .or_insert_with(|| StdRng::seed_from_u64(self.seed ^ ((u64::from(actor.0) << 32) | u64::from(actor.0))));
        Duration::from_millis(rng.gen_range(range.min..=range.max))
    }
}

impl DelayStrategy for SeededJitter {
    fn processing_delay(&self, actor: ActorId) -> HazardResult<Duration> {
        Ok(self.draw(actor, self.processing))
    }

    fn backoff(&self, actor: ActorId) -> Duration {
        self.draw(actor, self.backoff)
    }
}

impl fmt::Debug for SeededJitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededJitter")
            .field("seed", &self.seed)
            .field("processing", &self.processing)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Wraps another strategy and fails every `every`-th processing delay
#[derive(Debug)]
pub struct FaultInjector {
    inner: Box<dyn DelayStrategy>,
    every: u64,
    calls: AtomicU64,
    injected: AtomicU64,
}

impl FaultInjector {
    pub fn new(inner: Box<dyn DelayStrategy>, every: u64) -> Self {
        Self {
            inner,
            every: every.max(1),
            calls: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// Number of faults raised so far
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }
}

impl DelayStrategy for FaultInjector {
    fn processing_delay(&self, actor: ActorId) -> HazardResult<Duration> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if call % self.every == 0 {
            self.injected.fetch_add(1, Ordering::Relaxed);
            warn!(%actor, call, "injecting processing fault");
            return Err(HazardError::InjectedFault { actor });
        }
        self.inner.processing_delay(actor)
    }

    fn backoff(&self, actor: ActorId) -> Duration {
        self.inner.backoff(actor)
    }
}
