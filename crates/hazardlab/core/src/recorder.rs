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

//! Append-only sink for hazard findings
//!
//! Any task may append concurrently. Readers get copies ordered by detection
//! time; the live vector is never handed out. Logging hangs off the recorder
//! as a subscriber instead of being a side channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Timestamp;
use crate::types::{ActorId, CellId, HazardKind, Priority, ResourceId};

/// What the detector saw when it produced a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evidence {
    /// A wait-for cycle that survived the recheck window
    WaitCycle {
        cycle: Vec<ActorId>,
        resources: Vec<ResourceId>,
        persisted_ms: u64,
        victim: Option<ActorId>,
    },
    /// A group retrying in a rotating dependency without progress
    NoProgress {
        stalled_ms: u64,
        retries: u64,
        blockers: Vec<(ActorId, ActorId)>,
    },
    /// One actor waiting past the threshold while others progress
    WaitExceeded {
        priority: Priority,
        waited_ms: u64,
        average_wait_ms: Option<u64>,
        threshold_ms: u64,
        others_completed: u64,
    },
    /// An unguarded write overwrote a value it never read
    LostUpdate {
        cell: CellId,
        read_value: i64,
        read_version: u64,
        overwritten_version: u64,
        written_value: i64,
    },
    /// Final value differs from the serialized-equivalent value
    Discrepancy { cell: CellId, observed: i64, serialized: i64, delta: i64 },
    /// An operation completed after an operation intended to follow it
    SequenceInversion {
        operation: u64,
        intended: u64,
        actual_position: u64,
        overtaken_by: Vec<u64>,
    },
    /// An operation completed before its declared predecessor
    MissingPredecessor { operation: u64, predecessor: u64 },
}

/// An immutable finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub kind: HazardKind,
    pub involved_actors: Vec<ActorId>,
    pub detected_at: Timestamp,
    pub evidence: Evidence,
}

impl ViolationRecord {
    pub fn new(kind: HazardKind, mut involved_actors: Vec<ActorId>, detected_at: Timestamp, evidence: Evidence) -> Self {
        involved_actors.sort_unstable();
        involved_actors.dedup();
        Self {
            kind,
            involved_actors,
            detected_at,
            evidence,
        }
    }

    /// Lost-update suspicions are unconfirmed; everything else is confirmed
    pub fn is_confirmed(&self) -> bool {
        !matches!(self.evidence, Evidence::LostUpdate { .. })
    }

    pub fn involves(&self, actor: ActorId) -> bool {
        self.involved_actors.binary_search(&actor).is_ok()
    }
}

/// Consumer notified of every appended record
pub trait ViolationSubscriber: Send + Sync {
    fn on_record(&self, record: &ViolationRecord);
}

/// Emits one structured log event per record
#[derive(Debug, Default)]
pub struct TracingSubscriber;

impl ViolationSubscriber for TracingSubscriber {
    fn on_record(&self, record: &ViolationRecord) {
        warn!(
            kind = %record.kind,
            actors = ?record.involved_actors,
            at = %record.detected_at,
            confirmed = record.is_confirmed(),
            evidence = ?record.evidence,
            "hazard detected"
        );
    }
}

/// Append-only, concurrently writable record store
#[derive(Default)]
pub struct ViolationRecorder {
    records: Mutex<Vec<ViolationRecord>>,
    subscribers: RwLock<Vec<Arc<dyn ViolationSubscriber>>>,
}

impl ViolationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder that logs every record through `tracing`
    pub fn with_tracing() -> Self {
        let recorder = Self::new();
        recorder.subscribe(Arc::new(TracingSubscriber));
        recorder
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ViolationSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn append(&self, record: ViolationRecord) {
        self.records.lock().push(record.clone());
        for subscriber in self.subscribers.read().iter() {
            subscriber.on_record(&record);
        }
    }

    /// All records, ordered by detection time (stable for equal timestamps)
    pub fn records(&self) -> Vec<ViolationRecord> {
        let mut records = self.records.lock().clone();
        records.sort_by_key(|record| record.detected_at);
        records
    }

    pub fn records_of(&self, kind: HazardKind) -> Vec<ViolationRecord> {
        self.records().into_iter().filter(|record| record.kind == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_by_kind(&self) -> BTreeMap<HazardKind, usize> {
        count_by_kind(&self.records.lock())
    }
}

pub(crate) fn count_by_kind(records: &[ViolationRecord]) -> BTreeMap<HazardKind, usize> {
    let mut counts: BTreeMap<HazardKind, usize> = HazardKind::ALL.iter().map(|kind| (*kind, 0)).collect();
    for record in records {
        *counts.entry(record.kind).or_default() += 1;
    }
    counts
}

impl std::fmt::Debug for ViolationRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViolationRecorder")
            .field("records", &self.len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}
