// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The static table: a process-wide, append-only mapping from stable labels
//! to decoders that rebuild thunks from payload bytes.
//!
//! The table has two phases.  During startup it accepts registrations; the
//! runtime then calls [`seal`] exactly once, after which the table is
//! immutable and readable without locks.  Looking anything up before the
//! seal is a programmer error and panics; registering after the seal is a
//! recoverable error so embedding programs can report it.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{codec, ClosureError};

/// Rebuilds a thunk from payload bytes.  The box holds the thunk type the
/// matching `Closure<T>` expects; a mismatch is a fatal protocol error.
pub type Decoder =
    Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, ClosureError> + Send + Sync>;

fn building() -> &'static Mutex<HashMap<String, Decoder>> {
    static BUILDING: OnceLock<Mutex<HashMap<String, Decoder>>> = OnceLock::new();
    BUILDING.get_or_init(|| Mutex::new(HashMap::new()))
}

static SEALED: OnceLock<HashMap<String, Decoder>> = OnceLock::new();

/// Register a decoder under `label`.  Fails on duplicate labels and after
/// the table is sealed.
pub fn register(label: impl Into<String>, decoder: Decoder) -> Result<(), ClosureError> {
    let label = label.into();
    let mut map = building().lock().expect("registry lock poisoned");
    // Checked under the building lock: seal() also holds it, so a
    // registration can never slip into an already-sealed table.
    if SEALED.get().is_some() {
        return Err(ClosureError::Sealed(label));
    }
    if map.contains_key(&label) {
        return Err(ClosureError::DuplicateLabel(label));
    }
    debug!(target: "shoal::registry", %label, "static table entry registered");
    map.insert(label, decoder);
    Ok(())
}

/// Register `label` unless it is already present.  Typed registration
/// helpers use this so overlapping bundles (e.g. two skeletons sharing a
/// value type) can each declare what they need.
pub fn ensure(label: impl Into<String>, decoder: impl FnOnce() -> Decoder) -> Result<(), ClosureError> {
    let label = label.into();
    let mut map = building().lock().expect("registry lock poisoned");
    if let Some(sealed) = SEALED.get() {
        return if sealed.contains_key(&label) {
            Ok(())
        } else {
            Err(ClosureError::Sealed(label))
        };
    }
    if !map.contains_key(&label) {
        debug!(target: "shoal::registry", %label, "static table entry registered");
        map.insert(label, decoder());
    }
    Ok(())
}

/// Seal the table.  Idempotent; after the first call registrations fail.
pub fn seal() {
    let mut map = building().lock().expect("registry lock poisoned");
    if SEALED.get().is_some() {
        return;
    }
    let _ = SEALED.set(std::mem::take(&mut *map));
}

pub fn is_sealed() -> bool {
    SEALED.get().is_some()
}

/// Look up a label in the sealed table.
///
/// # Panics
///
/// Panics when called before [`seal`] — consulting the static table while
/// it is still being populated is a programming error, not a runtime
/// condition.
pub fn lookup(label: &str) -> Result<&'static Decoder, ClosureError> {
    let table = SEALED
        .get()
        .expect("static table consulted before seal; call registry::seal() at startup");
    table
        .get(label)
        .ok_or_else(|| ClosureError::RegistryMiss(label.to_string()))
}

/// All registered labels, sorted.  Emitted by the runtime's static-table
/// dump on the main node.
pub fn labels() -> Vec<String> {
    let mut out: Vec<String> = match SEALED.get() {
        Some(table) => table.keys().cloned().collect(),
        None => building()
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect(),
    };
    out.sort();
    out
}

// ── Value types ───────────────────────────────────────────────────────────────

/// Capability bundle for values that can cross the wire inside closures:
/// serialisable, rebuildable, and cheap to hand to multiple readers.
/// Blanket-implemented; user types only need the serde derives plus `Clone`.
pub trait WireValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> WireValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Label of the normal-form encoding for `T`.  `type_name` is stable across
/// all nodes running the same binary, which is the only identity the static
/// table requires.
pub fn value_label<T: 'static>() -> String {
    format!("shoal.value<{}>", type_name::<T>())
}

/// Register the normal-form encoding for `T`, enabling `to_closure::<T>`
/// and `force` on closures of `T`.
pub fn register_value<T: WireValue>() -> Result<(), ClosureError> {
    ensure(value_label::<T>(), || {
        Box::new(|bytes| Ok(Box::new(codec::decode::<T>(bytes)?)))
    })
}

/// Normal-form encodings for the primitive types most programs ship.
pub fn register_builtins() -> Result<(), ClosureError> {
    register_value::<()>()?;
    register_value::<bool>()?;
    register_value::<i64>()?;
    register_value::<u64>()?;
    register_value::<f64>()?;
    register_value::<String>()?;
    register_value::<Vec<u8>>()?;
    register_value::<Vec<i64>>()?;
    register_value::<Vec<u64>>()?;
    register_value::<Vec<f64>>()?;
    register_value::<Vec<String>>()?;
    Ok(())
}
