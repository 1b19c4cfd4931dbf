// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Globally addressable single-assignment cells.
//!
//! [`glob`] registers a local `IVar<Closure<T>>` in the node-local table of
//! globalised cells and hands out a `(owner, slot)` handle that any node can
//! write through exactly once.  The table keeps the cell alive until its
//! single write arrives, then frees the slot.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use shoal_closure::{Closure, WireForm, WireValue};

use crate::error::{Result, RtError};
use crate::ivar::IVar;
use crate::location::{self, level, NodeId};
use crate::rt_debug;

/// Global handle to an IVar living on `owner`.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct GIVar<T> {
    owner: NodeId,
    slot: u64,
    _t: PhantomData<fn() -> T>,
}

impl<T> GIVar<T> {
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }
}

impl<T> Clone for GIVar<T> {
    fn clone(&self) -> Self {
        GIVar {
            owner: self.owner,
            slot: self.slot,
            _t: PhantomData,
        }
    }
}

impl<T> Copy for GIVar<T> {}

impl<T> fmt::Debug for GIVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GIVar({}, {})", self.owner, self.slot)
    }
}

// ── Node-local table of globalised cells ──────────────────────────────────────

struct Slot {
    /// The `IVar<Closure<T>>` behind a type-erased box; [`write_local`]
    /// downcasts it back.
    cell: Box<dyn Any + Send + Sync>,
    /// Writer used for the remote path: decode the shipped wire form and
    /// fill the cell.
    write_wire: Box<dyn Fn(WireForm) -> Result<()> + Send + Sync>,
}

struct Table {
    next_slot: u64,
    slots: HashMap<u64, Slot>,
}

fn table() -> &'static Mutex<Table> {
    static TABLE: OnceLock<Mutex<Table>> = OnceLock::new();
    TABLE.get_or_init(|| {
        Mutex::new(Table {
            next_slot: 0,
            slots: HashMap::new(),
        })
    })
}

/// Globalise a local cell: allocate a slot and return the global handle.
pub fn glob<T: WireValue>(iv: &IVar<Closure<T>>) -> Result<GIVar<T>> {
    let owner = location::my_node()?;
    let cell = iv.clone();
    let write_target = iv.clone();
    let mut tab = table().lock().expect("givar table lock poisoned");
    let slot = tab.next_slot;
    tab.next_slot += 1;
    tab.slots.insert(
        slot,
        Slot {
            cell: Box::new(cell),
            write_wire: Box::new(move |wire| write_target.put(Closure::<T>::from_wire(wire))),
        },
    );
    rt_debug!(level::GIVAR, "globalised cell at slot {slot}");
    Ok(GIVar {
        owner,
        slot,
        _t: PhantomData,
    })
}

/// Fill a globalised cell from an incoming RPUT wire form.  The slot is
/// freed by its single write; a write to a missing slot means the cell was
/// already written.
pub(crate) fn write_remote(slot: u64, wire: WireForm) -> Result<()> {
    let entry = table()
        .lock()
        .expect("givar table lock poisoned")
        .slots
        .remove(&slot);
    match entry {
        Some(s) => {
            rt_debug!(level::GIVAR, "remote write resolving slot {slot}");
            (s.write_wire)(wire)
        }
        None => Err(RtError::DoublePut),
    }
}

/// Fill a globalised cell owned by this node without a serialisation
/// round-trip.
pub(crate) fn write_local<T: WireValue>(gv: &GIVar<T>, value: Closure<T>) -> Result<()> {
    let entry = table()
        .lock()
        .expect("givar table lock poisoned")
        .slots
        .remove(&gv.slot);
    match entry {
        Some(s) => {
            rt_debug!(level::GIVAR, "local write resolving slot {}", gv.slot);
            let iv = s
                .cell
                .downcast::<IVar<Closure<T>>>()
                .map_err(|_| RtError::Internal(format!("slot {} holds a different cell type", gv.slot)))?;
            iv.put(value)
        }
        None => Err(RtError::DoublePut),
    }
}

/// Slots still awaiting their write.  Non-empty at quiescence is the
/// `TerminationViolation` error kind.
pub(crate) fn outstanding_slots() -> Vec<u64> {
    let mut slots: Vec<u64> = table()
        .lock()
        .expect("givar table lock poisoned")
        .slots
        .keys()
        .copied()
        .collect();
    slots.sort_unstable();
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    // NodeId init is process-wide; these tests only exercise the slot
    // table through the wire path, which does not consult identity.

    #[test]
    fn remote_write_to_unknown_slot_is_double_put() {
        let wire = WireForm {
            label: "whatever".to_string(),
            payload: vec![],
        };
        let err = write_remote(u64::MAX, wire).unwrap_err();
        assert!(matches!(err, RtError::DoublePut));
    }
}
