//! Change descriptors and the pre-send coalescer.
//!
//! A [`Change`] is the unit of work moving through the broadcast
//! pipeline: create / update / delete, the touched fields, and the
//! field-clock fragment for exactly those fields. [`coalesce`] merges a
//! burst of pending descriptors into the minimal equivalent set just
//! before a batch leaves the local queue:
//!
//! - update + update on one object → one update (later value wins per
//!   field, clock fragments unioned per field)
//! - create + update → the create absorbs the update
//! - anything + delete → a single delete
//! - create + delete inside one uncommitted batch → nothing at all
//!
//! Distinct object ids never merge. The pass is pure and idempotent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::clock::{wall_clock_ms, FieldClocks};
use crate::object::{BoardObject, ObjectPatch};

/// A single mutation descriptor.
///
/// `ts` is the origination time in milliseconds, carried purely for
/// debugging and ordering display — convergence relies on the clock
/// fragments, never on `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Create {
        object: BoardObject,
        clocks: FieldClocks,
        ts: u64,
    },
    Update {
        id: Uuid,
        patch: ObjectPatch,
        clocks: FieldClocks,
        ts: u64,
    },
    Delete {
        id: Uuid,
        clocks: FieldClocks,
        ts: u64,
    },
}

impl Change {
    pub fn create(object: BoardObject, clocks: FieldClocks) -> Self {
        Change::Create {
            object,
            clocks,
            ts: wall_clock_ms(),
        }
    }

    pub fn update(id: Uuid, patch: ObjectPatch, clocks: FieldClocks) -> Self {
        Change::Update {
            id,
            patch,
            clocks,
            ts: wall_clock_ms(),
        }
    }

    pub fn delete(id: Uuid, clocks: FieldClocks) -> Self {
        Change::Delete {
            id,
            clocks,
            ts: wall_clock_ms(),
        }
    }

    pub fn object_id(&self) -> Uuid {
        match self {
            Change::Create { object, .. } => object.id,
            Change::Update { id, .. } | Change::Delete { id, .. } => *id,
        }
    }

    pub fn ts(&self) -> u64 {
        match self {
            Change::Create { ts, .. } | Change::Update { ts, .. } | Change::Delete { ts, .. } => {
                *ts
            }
        }
    }

    pub fn clocks(&self) -> &FieldClocks {
        match self {
            Change::Create { clocks, .. }
            | Change::Update { clocks, .. }
            | Change::Delete { clocks, .. } => clocks,
        }
    }
}

/// Merge one pending slot with the next descriptor for the same object.
///
/// `None` means the object's net effect within this batch is nothing
/// (it was created and deleted before ever reaching the network).
fn fold(prev: Option<Change>, next: Change) -> Option<Change> {
    match (prev, next) {
        // Slot already cancelled out: the later write stands alone.
        (None, next) => Some(next),

        // Update following a create folds into the create.
        (
            Some(Change::Create { mut object, mut clocks, ts }),
            Change::Update { patch, clocks: later, ts: later_ts, .. },
        ) => {
            patch.apply_to(&mut object);
            clocks.overlay(&later);
            Some(Change::Create {
                object,
                clocks,
                ts: ts.max(later_ts),
            })
        }

        // Created and deleted within one uncommitted batch: the object
        // never externally existed.
        (Some(Change::Create { .. }), Change::Delete { .. }) => None,

        // Two updates merge field sets; the clock fragment per field
        // follows whichever update set that field.
        (
            Some(Change::Update { id, mut patch, mut clocks, ts }),
            Change::Update { patch: later_patch, clocks: later, ts: later_ts, .. },
        ) => {
            patch.merge(&later_patch);
            clocks.overlay(&later);
            Some(Change::Update {
                id,
                patch,
                clocks,
                ts: ts.max(later_ts),
            })
        }

        // Delete following an update: the net result is a single delete.
        (Some(Change::Update { ts, .. }), Change::Delete { id, clocks, ts: later_ts }) => {
            Some(Change::Delete {
                id,
                clocks,
                ts: ts.max(later_ts),
            })
        }

        // A write after a pending delete resurrects: the later
        // descriptor replaces the delete outright (add-wins).
        (Some(Change::Delete { .. }), next @ Change::Update { .. })
        | (Some(Change::Delete { .. }), next @ Change::Create { .. }) => Some(next),

        (Some(Change::Delete { ts, .. }), Change::Delete { id, clocks, ts: later_ts }) => {
            Some(Change::Delete {
                id,
                clocks,
                ts: ts.max(later_ts),
            })
        }

        // A second create replaces the first (should not normally occur).
        (Some(_), next @ Change::Create { .. }) => Some(next),
    }
}

/// Coalesce an ordered descriptor list into the minimal equivalent set.
///
/// Pure and always succeeding; output preserves the order in which each
/// object id first appeared.
pub fn coalesce(changes: Vec<Change>) -> Vec<Change> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut merged: HashMap<Uuid, Option<Change>> = HashMap::new();

    for change in changes {
        let id = change.object_id();
        match merged.get_mut(&id) {
            None => {
                order.push(id);
                merged.insert(id, Some(change));
            }
            Some(slot) => {
                let folded = fold(slot.take(), change);
                *slot = folded;
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| merged.remove(&id).flatten())
        .collect()
}
