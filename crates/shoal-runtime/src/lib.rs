// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The shoal runtime core: node identity, single-assignment cells, the
//! spark scheduler, and the inter-node message protocol.
//!
//! A user program builds a plan over the [`Par`] handle — forking local
//! tasks, sparking stealable closures, pushing work at chosen peers, and
//! awaiting [`IVar`]s — and hands it to [`run_par`], which executes it
//! across the configured node mesh and tears everything down once the
//! cluster is quiescent.

mod comm;
mod error;
mod givar;
mod ivar;
mod message;
mod par;
mod scheduler;
mod sparkpool;
mod stats;

pub mod location;

pub use error::{Result, RtError};
pub use givar::{glob, GIVar};
pub use ivar::IVar;
pub use location::{all_nodes, main_node, my_node, peers, try_my_node, NodeId};
pub use message::{Msg, QuiesceProbe};
pub use par::{
    par_fn_closure, par_fn_env_closure, register_par_fn, register_par_fn_env, register_spawn_fn,
    register_spawnable, register_task_fn, spawn_fn_closure, task_closure, Par, ParClosure,
    ParFnClosure, ParFnThunk, ParThunk, ParValThunk, SpawnClosure,
};
pub use scheduler::run_par;
