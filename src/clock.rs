//! Hybrid logical clocks and per-field clock bookkeeping.
//!
//! Every mutation a client makes is stamped with a `ClockValue` — a
//! (wall_ms, counter, client_id) triple with a total order:
//!
//! ```text
//! a < b  ⇔  (a.wall_ms, a.counter, a.client_id) < (b.wall_ms, b.counter, b.client_id)
//! ```
//!
//! The client identity tie-break means two distinct clients can never
//! produce an equal-and-ambiguous value, so last-writer-wins resolution
//! is deterministic everywhere it is applied: locally, on the wire, and
//! inside the durable store's merge procedure.
//!
//! Reference: Kleppmann — DDIA, Chapter 8 (Ordering and Causality)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// Synthetic field name that lets deletion participate in the same
/// per-field comparison rule as ordinary writes.
pub const FIELD_DELETED: &str = "__deleted";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A hybrid logical clock value.
///
/// Ordering is lexicographic over (wall_ms, counter, client_id), which
/// the derived `Ord` provides via field declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockValue {
    /// Wall-clock milliseconds component.
    pub wall_ms: u64,
    /// Logical counter for sub-millisecond ordering.
    pub counter: u32,
    /// Issuing client, used as the final tie-break.
    pub client_id: Uuid,
}

impl ClockValue {
    /// The zero clock for a client (orders before any ticked value).
    pub fn zero(client_id: Uuid) -> Self {
        Self {
            wall_ms: 0,
            counter: 0,
            client_id,
        }
    }
}

/// Per-client hybrid logical clock.
///
/// `tick` is strictly increasing under the total order above, and is
/// guaranteed to exceed every peer clock previously passed to `observe`:
/// observed peer values pull the (wall_ms, counter) prefix forward, and
/// the next tick advances past it even when local wall time lags.
#[derive(Debug, Clone)]
pub struct HybridClock {
    client_id: Uuid,
    last: ClockValue,
}

impl HybridClock {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            last: ClockValue::zero(client_id),
        }
    }

    /// The identity this clock stamps values with.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Advance the clock and return the new value.
    ///
    /// Uses fresh wall time when it has advanced; otherwise bumps the
    /// counter so the result is still strictly greater than the last.
    pub fn tick(&mut self) -> ClockValue {
        let now = wall_clock_ms();
        if now > self.last.wall_ms {
            self.last.wall_ms = now;
            self.last.counter = 0;
        } else {
            self.last.counter = self.last.counter.saturating_add(1);
        }
        self.last
    }

    /// Record a peer clock so subsequent ticks order after it.
    pub fn observe(&mut self, remote: &ClockValue) {
        if (remote.wall_ms, remote.counter) > (self.last.wall_ms, self.last.counter) {
            self.last.wall_ms = remote.wall_ms;
            self.last.counter = remote.counter;
        }
    }

    /// The most recent value produced or observed.
    pub fn last(&self) -> ClockValue {
        self.last
    }
}

/// Compare two clock values under the total order.
pub fn compare(a: &ClockValue, b: &ClockValue) -> Ordering {
    a.cmp(b)
}

/// A fragment of field clocks: field name → winning clock value.
///
/// Attached to change descriptors (only the fields touched by the
/// change) and stored per object in the durable store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldClocks {
    pub fields: HashMap<String, ClockValue>,
}

impl FieldClocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&ClockValue> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: ClockValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Overlay `later` onto `self`: for every field the later fragment
    /// carries, its clock replaces ours.
    pub fn overlay(&mut self, later: &FieldClocks) {
        for (field, value) in &later.fields {
            self.fields.insert(field.clone(), *value);
        }
    }

    /// Merge keeping the greater clock per field (used when folding
    /// remote fragments into the local store).
    pub fn merge_max(&mut self, other: &FieldClocks) {
        for (field, value) in &other.fields {
            match self.fields.get(field) {
                Some(existing) if existing >= value => {}
                _ => {
                    self.fields.insert(field.clone(), *value);
                }
            }
        }
    }
}

/// Per-client store of field clocks for every object this client knows.
///
/// Advisory by design: it tells this client which of its own field
/// values should resist being overwritten by stale incoming data. It
/// never gates local application of the client's own writes.
#[derive(Debug)]
pub struct FieldClockStore {
    clock: HybridClock,
    by_object: HashMap<Uuid, FieldClocks>,
}

impl FieldClockStore {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            clock: HybridClock::new(client_id),
            by_object: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.clock.client_id()
    }

    /// Stamp every populated field of a freshly created object.
    ///
    /// A single tick is shared across all fields, which keeps the
    /// fragment internally consistent for later comparisons.
    pub fn stamp_create(&mut self, object_id: Uuid, fields: &[&str]) -> FieldClocks {
        let tick = self.clock.tick();
        let mut fragment = FieldClocks::new();
        for field in fields {
            fragment.set(*field, tick);
        }
        self.by_object
            .entry(object_id)
            .or_default()
            .overlay(&fragment);
        fragment
    }

    /// Stamp only the named fields with one fresh tick.
    pub fn stamp_change(&mut self, object_id: Uuid, fields: &[&str]) -> FieldClocks {
        let tick = self.clock.tick();
        let mut fragment = FieldClocks::new();
        for field in fields {
            fragment.set(*field, tick);
        }
        self.by_object
            .entry(object_id)
            .or_default()
            .overlay(&fragment);
        fragment
    }

    /// Stamp the synthetic tombstone field for a deletion.
    pub fn stamp_delete(&mut self, object_id: Uuid) -> FieldClocks {
        self.stamp_change(object_id, &[FIELD_DELETED])
    }

    /// Fold a remote fragment in, keeping the greater clock per field,
    /// and pull the local clock forward past every observed value.
    pub fn observe_remote(&mut self, object_id: Uuid, fragment: &FieldClocks) {
        for value in fragment.fields.values() {
            self.clock.observe(value);
        }
        self.by_object
            .entry(object_id)
            .or_default()
            .merge_max(fragment);
    }

    pub fn get(&self, object_id: &Uuid) -> Option<&FieldClocks> {
        self.by_object.get(object_id)
    }

    /// Replace the stored clocks for an object (bulk load path).
    pub fn set_object_clocks(&mut self, object_id: Uuid, clocks: FieldClocks) {
        for value in clocks.fields.values() {
            self.clock.observe(value);
        }
        self.by_object.insert(object_id, clocks);
    }

    pub fn remove_object(&mut self, object_id: &Uuid) {
        self.by_object.remove(object_id);
    }

    /// Iterate over every object id with stored clocks.
    pub fn object_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.by_object.keys()
    }

    pub fn clear(&mut self) {
        self.by_object.clear();
    }
}
