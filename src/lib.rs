// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! shoal — a distributed task-parallel runtime.
//!
//! User programs express computation as a plan over the task monad
//! ([`runtime::Par`]), shipping work between nodes as registered closures.
//! The scheduler interleaves local fork/join with distributed work
//! stealing (sparks, stolen via the fishing protocol) and eager placement
//! (pushes), while single-assignment cells carry results home.
//!
//! ```no_run
//! use shoal::prelude::*;
//!
//! fn double(x: i64) -> i64 {
//!     x * 2
//! }
//!
//! fn main() -> shoal::runtime::Result<()> {
//!     register_builtins()?;
//!     register_par_map::<i64, i64>()?;
//!     register_fn("demo::double", double as fn(i64) -> i64)?;
//!
//!     let cfg = RuntimeConfig::single_node();
//!     shoal::init_tracing(cfg.debug_level);
//!     let out = run_par(cfg, |par| async move {
//!         let f = fn_closure("demo::double", double as fn(i64) -> i64);
//!         par_map_nf(&par, &f, (0..10).collect()).await
//!     })?;
//!     assert_eq!(out.unwrap(), (0..10).map(|x| x * 2).collect::<Vec<_>>());
//!     Ok(())
//! }
//! ```

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

pub use shoal_closure as closure;
pub use shoal_config as config;
pub use shoal_runtime as runtime;
pub use shoal_strategies as strategies;

/// Install a stderr tracing subscriber honouring the node's debug level.
/// `RUST_LOG` overrides the derived filter.  Call once, before `run_par`.
pub fn init_tracing(debug_level: u8) {
    let default = if debug_level == 0 {
        "warn"
    } else {
        "warn,shoal=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// The names almost every embedding program wants.
pub mod prelude {
    pub use shoal_closure::{
        apply, compose, fn_closure, fn_env_closure, register_apply, register_builtins,
        register_compose, register_fn, register_fn_env, to_closure, Closure, FnClosure, ForceNf,
        WireForm,
    };
    pub use shoal_config::{load as load_config, RuntimeConfig};
    pub use shoal_runtime::{
        all_nodes, my_node, par_fn_closure, peers, register_par_fn, register_spawn_fn,
        register_spawnable, run_par, spawn_fn_closure, GIVar, IVar, NodeId, Par, Result, RtError,
    };
    pub use shoal_strategies::{
        chunk, force_cc, map_reduce_range_thresh, par_closure_list, par_divide_and_conquer,
        par_map, par_map_chunked, par_map_m, par_map_nf, par_map_sliced, push_divide_and_conquer,
        push_map, r0, rdeepseq, register_divide_and_conquer, register_map_lift,
        register_map_reduce, register_nf_strategies, register_par_map, register_par_map_m,
        register_strategies, rseq, slice, spark_closure, unchunk, unslice, using, InclusiveRange,
        Placement, Strategy,
    };
}
