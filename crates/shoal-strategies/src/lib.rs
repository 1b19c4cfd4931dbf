// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Evaluation strategies and parallel skeletons.
//!
//! A strategy is a semantic identity in the task monad — `using(x, s)`
//! returns a closure equal in value to `x`, while `s` decides how much gets
//! evaluated and where.  On top of the proto-strategies (`spark_closure`,
//! `push_closure`) sit the list strategies, clustering combinators, task
//! farms, divide-and-conquer, and threshold map-reduce.

mod cluster;
mod skeletons;
mod strategy;

pub use cluster::{chunk, eval_cluster_by, slice, unchunk, unslice};
pub use skeletons::{
    lift_to_chunks, map_reduce_range_thresh, par_divide_and_conquer, par_map, par_map_chunked,
    par_map_m, par_map_m_, par_map_nf, par_map_sliced, push_divide_and_conquer, push_map,
    push_map_m, push_map_m_, push_rand_map, push_rand_map_m, push_rand_map_m_,
    register_divide_and_conquer, register_map_lift, register_map_reduce, register_par_map,
    register_par_map_m, InclusiveRange, Placement,
};
pub use strategy::{
    force_cc, par_closure_list, push_closure, push_closure_list, push_rand_closure_list, r0,
    rdeepseq, register_nf_strategies, register_strategies, rseq, spark_closure, using, Strategy,
    StrategyThunk,
};
