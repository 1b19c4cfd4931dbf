// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Serialisable closures.
//!
//! A [`Closure<T>`] bundles a locally runnable thunk with a wire form
//! `(label, payload bytes)`.  The label names an entry in the process-wide
//! [`registry`]; deserialising a closure on another node rebuilds the thunk
//! by applying the registered decoder to the payload.  Every node in a
//! cluster runs the same binary and populates the registry identically
//! before the runtime starts, so a label resolves to operationally
//! equivalent code everywhere.

mod closure;
mod error;
pub mod codec;
pub mod registry;

pub use closure::{
    apply, compose, fn_closure, fn_env_closure, register_apply, register_compose, register_fn,
    register_fn_env, to_closure, Closure, FnClosure, FnThunk, ForceNf, WireForm,
};
pub use error::ClosureError;
pub use registry::{register_builtins, register_value, value_label, WireValue};

pub type Result<T> = std::result::Result<T, ClosureError>;
