// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parallel skeletons: task farms, divide-and-conquer, and map-reduce over
//! an inclusive integer range.
//!
//! Every skeleton ships its work as registered closures, so each has a
//! `register_*` bundle that must run on every node before the registry
//! seals.  Labels are derived from the element types; nodes running the
//! same binary agree on them.

use std::any::type_name;
use std::sync::Arc;

use async_recursion::async_recursion;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

use shoal_closure::{
    apply, codec, register_apply, registry, to_closure, Closure, FnClosure, FnThunk, WireForm,
    WireValue,
};
use shoal_runtime::{
    all_nodes, par_fn_env_closure, register_par_fn_env, register_spawn_fn, register_spawnable,
    register_task_fn, spawn_fn_closure, task_closure, GIVar, IVar, NodeId, Par, ParFnClosure,
    Result, RtError,
};

use crate::cluster::{chunk, eval_cluster_by, slice, unchunk, unslice};
use crate::strategy::{
    force_cc, par_closure_list, push_closure_list, push_rand_closure_list, register_strategies,
    Strategy,
};

/// Where speculative work goes: the spark pool (lazy, stolen on demand) or
/// straight to a random peer (eager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Spark,
    PushRand,
}

// ── Task farms ────────────────────────────────────────────────────────────────

/// Everything `par_map` and friends need at `A -> B`.
pub fn register_par_map<A: WireValue, B: WireValue>() -> Result<()> {
    registry::register_value::<A>()?;
    register_apply::<A, B>()?;
    register_strategies::<B>()?;
    Ok(())
}

/// Lift every element to a closure, apply `f` under `strat`, and hand back
/// the (locally unforced) results in input order.
pub async fn par_map<A: WireValue, B: WireValue>(
    par: &Par,
    strat: &Strategy<B>,
    f: &FnClosure<A, B>,
    xs: Vec<A>,
) -> Result<Vec<B>> {
    let mut tasks = Vec::with_capacity(xs.len());
    for x in &xs {
        tasks.push(apply(f, &to_closure(x)?)?);
    }
    let done = par_closure_list(par, strat, tasks).await?;
    done.iter()
        .map(|c| c.value().map_err(RtError::from))
        .collect()
}

/// `par_map` under full normal-form evaluation.
pub async fn par_map_nf<A: WireValue, B: WireValue>(
    par: &Par,
    f: &FnClosure<A, B>,
    xs: Vec<A>,
) -> Result<Vec<B>> {
    par_map(par, &force_cc::<B>(), f, xs).await
}

/// `par_map` with one task per contiguous chunk of `k` elements.
pub async fn par_map_chunked<A: WireValue, B: WireValue>(
    par: &Par,
    k: usize,
    strat: &Strategy<Vec<B>>,
    f: &FnClosure<A, B>,
    xs: Vec<A>,
) -> Result<Vec<B>> {
    let lifted = lift_to_chunks(f)?;
    eval_cluster_by(
        xs,
        |v| chunk(k, v),
        unchunk,
        |chunks| async move { par_map(par, strat, &lifted, chunks).await },
    )
    .await
}

/// `par_map` with one task per interleaved slice, `k` slices in total.
pub async fn par_map_sliced<A: WireValue, B: WireValue>(
    par: &Par,
    k: usize,
    strat: &Strategy<Vec<B>>,
    f: &FnClosure<A, B>,
    xs: Vec<A>,
) -> Result<Vec<B>> {
    let lifted = lift_to_chunks(f)?;
    eval_cluster_by(
        xs,
        |v| slice(k, v),
        unslice,
        |slices| async move { par_map(par, strat, &lifted, slices).await },
    )
    .await
}

/// Task farm with eager round-robin placement over `nodes`.
pub async fn push_map<A: WireValue, B: WireValue>(
    par: &Par,
    strat: &Strategy<B>,
    nodes: &[NodeId],
    f: &FnClosure<A, B>,
    xs: Vec<A>,
) -> Result<Vec<B>> {
    let mut tasks = Vec::with_capacity(xs.len());
    for x in &xs {
        tasks.push(apply(f, &to_closure(x)?)?);
    }
    let done = push_closure_list(par, strat, nodes, tasks).await?;
    done.iter()
        .map(|c| c.value().map_err(RtError::from))
        .collect()
}

/// Task farm with eager random placement over `nodes`.
pub async fn push_rand_map<A: WireValue, B: WireValue>(
    par: &Par,
    strat: &Strategy<B>,
    nodes: &[NodeId],
    f: &FnClosure<A, B>,
    xs: Vec<A>,
) -> Result<Vec<B>> {
    let mut tasks = Vec::with_capacity(xs.len());
    for x in &xs {
        tasks.push(apply(f, &to_closure(x)?)?);
    }
    let done = push_rand_closure_list(par, strat, nodes, tasks).await?;
    done.iter()
        .map(|c| c.value().map_err(RtError::from))
        .collect()
}

// ── Chunk lifting ─────────────────────────────────────────────────────────────

fn map_label<A: 'static, B: 'static>() -> String {
    format!("shoal.map<{} -> {}>", type_name::<A>(), type_name::<B>())
}

/// Closure mapping `f` over a chunk.  Its wire form carries `f`'s wire
/// form, so the lift survives transport.
pub fn lift_to_chunks<A: WireValue, B: WireValue>(
    f: &FnClosure<A, B>,
) -> Result<FnClosure<Vec<A>, Vec<B>>> {
    let ft = f.thunk()?.clone();
    let wire = WireForm {
        label: map_label::<A, B>(),
        payload: codec::encode(f.wire())?,
    };
    Ok(Closure::with_thunk(
        wire,
        FnThunk(Arc::new(move |xs: Vec<A>| {
            xs.into_iter().map(|x| (ft.0)(x)).collect()
        })),
    ))
}

pub fn register_map_lift<A: WireValue, B: WireValue>() -> Result<()> {
    registry::ensure(map_label::<A, B>(), || {
        Box::new(|bytes| {
            let fw: WireForm = codec::decode(bytes)?;
            let f: FnClosure<A, B> = Closure::from_wire(fw);
            let ft = f.thunk()?.clone();
            Ok(Box::new(FnThunk::<Vec<A>, Vec<B>>(Arc::new(move |xs| {
                xs.into_iter().map(|x| (ft.0)(x)).collect()
            }))))
        })
    })?;
    register_strategies::<Vec<B>>()?;
    register_apply::<Vec<A>, Vec<B>>()?;
    registry::register_value::<Vec<A>>()?;
    Ok(())
}

// ── Monadic task farms ────────────────────────────────────────────────────────

type MapMEnv<A, B> = (
    ParFnClosure<Closure<A>, Closure<B>>,
    Closure<A>,
    GIVar<B>,
);

type MapMVoidEnv<A, B> = (ParFnClosure<Closure<A>, Closure<B>>, Closure<A>);

fn mapm_label<A: 'static, B: 'static>() -> String {
    format!("shoal.map_m<{} -> {}>", type_name::<A>(), type_name::<B>())
}

fn mapm_void_label<A: 'static, B: 'static>() -> String {
    format!("shoal.map_m_<{} -> {}>", type_name::<A>(), type_name::<B>())
}

fn mapm_wrapper<A: WireValue, B: WireValue>(
    par: Par,
    env: MapMEnv<A, B>,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let (f, x, gv) = env;
        let y = (f.thunk()?.0)(par.clone(), x).await?;
        par.rput(&gv, y).await
    })
}

fn mapm_void_wrapper<A: WireValue, B: WireValue>(
    par: Par,
    env: MapMVoidEnv<A, B>,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let (f, x) = env;
        let _ = (f.thunk()?.0)(par, x).await?;
        Ok(())
    })
}

pub fn register_par_map_m<A: WireValue, B: WireValue>() -> Result<()> {
    registry::register_value::<A>()?;
    registry::register_value::<B>()?;
    register_task_fn::<MapMEnv<A, B>>(mapm_label::<A, B>(), mapm_wrapper::<A, B>)?;
    register_task_fn::<MapMVoidEnv<A, B>>(mapm_void_label::<A, B>(), mapm_void_wrapper::<A, B>)?;
    Ok(())
}

/// Apply a monadic function closure to every element, sparking one task
/// each; collect in input order.
pub async fn par_map_m<A: WireValue, B: WireValue>(
    par: &Par,
    f: &ParFnClosure<Closure<A>, Closure<B>>,
    xs: Vec<Closure<A>>,
) -> Result<Vec<Closure<B>>> {
    let mut cells = Vec::with_capacity(xs.len());
    for x in xs {
        let cell = IVar::new();
        let gv = par.glob(&cell)?;
        let task = task_closure(
            mapm_label::<A, B>(),
            mapm_wrapper::<A, B>,
            &(f.clone(), x, gv),
        )?;
        par.spark(task);
        cells.push(cell);
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        out.push(cell.get().await);
    }
    Ok(out)
}

/// As [`par_map_m`], discarding results: spark and return.
pub fn par_map_m_<A: WireValue, B: WireValue>(
    par: &Par,
    f: &ParFnClosure<Closure<A>, Closure<B>>,
    xs: Vec<Closure<A>>,
) -> Result<()> {
    for x in xs {
        let task = task_closure(
            mapm_void_label::<A, B>(),
            mapm_void_wrapper::<A, B>,
            &(f.clone(), x),
        )?;
        par.spark(task);
    }
    Ok(())
}

/// Eager monadic farm, `nodes` cycled round-robin.
pub async fn push_map_m<A: WireValue, B: WireValue>(
    par: &Par,
    f: &ParFnClosure<Closure<A>, Closure<B>>,
    nodes: &[NodeId],
    xs: Vec<Closure<A>>,
) -> Result<Vec<Closure<B>>> {
    if nodes.is_empty() {
        return Err(RtError::Config("push_map_m needs target nodes".to_string()));
    }
    let mut cells = Vec::with_capacity(xs.len());
    for (i, x) in xs.into_iter().enumerate() {
        let cell = IVar::new();
        let gv = par.glob(&cell)?;
        let task = task_closure(
            mapm_label::<A, B>(),
            mapm_wrapper::<A, B>,
            &(f.clone(), x, gv),
        )?;
        par.push_to(task, nodes[i % nodes.len()]).await?;
        cells.push(cell);
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        out.push(cell.get().await);
    }
    Ok(out)
}

/// As [`push_map_m`], discarding results.
pub async fn push_map_m_<A: WireValue, B: WireValue>(
    par: &Par,
    f: &ParFnClosure<Closure<A>, Closure<B>>,
    nodes: &[NodeId],
    xs: Vec<Closure<A>>,
) -> Result<()> {
    if nodes.is_empty() {
        return Err(RtError::Config("push_map_m_ needs target nodes".to_string()));
    }
    for (i, x) in xs.into_iter().enumerate() {
        let task = task_closure(
            mapm_void_label::<A, B>(),
            mapm_void_wrapper::<A, B>,
            &(f.clone(), x),
        )?;
        par.push_to(task, nodes[i % nodes.len()]).await?;
    }
    Ok(())
}

/// Eager monadic farm with uniformly random placement.
pub async fn push_rand_map_m<A: WireValue, B: WireValue>(
    par: &Par,
    f: &ParFnClosure<Closure<A>, Closure<B>>,
    nodes: &[NodeId],
    xs: Vec<Closure<A>>,
) -> Result<Vec<Closure<B>>> {
    if nodes.is_empty() {
        return Err(RtError::Config("push_rand_map_m needs target nodes".to_string()));
    }
    let mut cells = Vec::with_capacity(xs.len());
    for x in xs {
        let cell = IVar::new();
        let gv = par.glob(&cell)?;
        let task = task_closure(
            mapm_label::<A, B>(),
            mapm_wrapper::<A, B>,
            &(f.clone(), x, gv),
        )?;
        let node = nodes[rand::thread_rng().gen_range(0..nodes.len())];
        par.push_to(task, node).await?;
        cells.push(cell);
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        out.push(cell.get().await);
    }
    Ok(out)
}

/// As [`push_rand_map_m`], discarding results.
pub async fn push_rand_map_m_<A: WireValue, B: WireValue>(
    par: &Par,
    f: &ParFnClosure<Closure<A>, Closure<B>>,
    nodes: &[NodeId],
    xs: Vec<Closure<A>>,
) -> Result<()> {
    if nodes.is_empty() {
        return Err(RtError::Config("push_rand_map_m_ needs target nodes".to_string()));
    }
    for x in xs {
        let task = task_closure(
            mapm_void_label::<A, B>(),
            mapm_void_wrapper::<A, B>,
            &(f.clone(), x),
        )?;
        let node = nodes[rand::thread_rng().gen_range(0..nodes.len())];
        par.push_to(task, node).await?;
    }
    Ok(())
}

// ── Divide and conquer ────────────────────────────────────────────────────────

type DncFns<P, R> = (
    FnClosure<P, bool>,
    FnClosure<P, Vec<P>>,
    FnClosure<(P, Vec<R>), R>,
    FnClosure<P, R>,
);

fn dnc_label<P: 'static, R: 'static>() -> String {
    format!("shoal.dnc<{} -> {}>", type_name::<P>(), type_name::<R>())
}

/// The shippable recursive step: unpack the problem, recurse, return the
/// result as a forced closure.
fn dnc_task<P: WireValue, R: WireValue>(
    par: Par,
    env: (DncFns<P, R>, Placement),
    x: Closure<P>,
) -> BoxFuture<'static, Result<Closure<R>>> {
    Box::pin(async move {
        let ((trivial, decompose, combine, solve), mode) = env;
        let r = dnc_go(&par, &trivial, &decompose, &combine, &solve, mode, x.value()?).await?;
        Ok(to_closure(&r)?)
    })
}

#[async_recursion]
async fn dnc_go<P: WireValue, R: WireValue>(
    par: &Par,
    trivial: &FnClosure<P, bool>,
    decompose: &FnClosure<P, Vec<P>>,
    combine: &FnClosure<(P, Vec<R>), R>,
    solve: &FnClosure<P, R>,
    mode: Placement,
    x: P,
) -> Result<R> {
    if (trivial.thunk()?.0)(x.clone()) {
        return Ok((solve.thunk()?.0)(x));
    }
    let subs = (decompose.thunk()?.0)(x.clone());
    let step = par_fn_env_closure(
        dnc_label::<P, R>(),
        dnc_task::<P, R>,
        &(
            (
                trivial.clone(),
                decompose.clone(),
                combine.clone(),
                solve.clone(),
            ),
            mode,
        ),
    )?;
    let mut sub_closures = Vec::with_capacity(subs.len());
    for sub in &subs {
        sub_closures.push(to_closure(sub)?);
    }
    let solved = match mode {
        Placement::Spark => par_map_m(par, &step, sub_closures).await?,
        Placement::PushRand => push_rand_map_m(par, &step, all_nodes()?, sub_closures).await?,
    };
    let results: Vec<R> = solved
        .iter()
        .map(|c| c.value().map_err(RtError::from))
        .collect::<Result<_>>()?;
    Ok((combine.thunk()?.0)((x, results)))
}

/// Registration bundle for divide-and-conquer at `P -> R`.
pub fn register_divide_and_conquer<P: WireValue, R: WireValue>() -> Result<()> {
    registry::register_value::<P>()?;
    registry::register_value::<R>()?;
    register_par_map_m::<P, R>()?;
    register_par_fn_env::<(DncFns<P, R>, Placement), Closure<P>, Closure<R>>(
        dnc_label::<P, R>(),
        dnc_task::<P, R>,
    )?;
    Ok(())
}

/// Divide-and-conquer with lazy (sparked) subproblems.  Closure arguments:
/// `trivial` decides when to stop dividing, `decompose` splits a problem,
/// `solve` handles leaves, and `combine` merges `(problem, sub-results)`.
pub async fn par_divide_and_conquer<P: WireValue, R: WireValue>(
    par: &Par,
    trivial: &FnClosure<P, bool>,
    decompose: &FnClosure<P, Vec<P>>,
    combine: &FnClosure<(P, Vec<R>), R>,
    solve: &FnClosure<P, R>,
    x: P,
) -> Result<R> {
    dnc_go(par, trivial, decompose, combine, solve, Placement::Spark, x).await
}

/// Divide-and-conquer with eager random placement of subproblems.
pub async fn push_divide_and_conquer<P: WireValue, R: WireValue>(
    par: &Par,
    trivial: &FnClosure<P, bool>,
    decompose: &FnClosure<P, Vec<P>>,
    combine: &FnClosure<(P, Vec<R>), R>,
    solve: &FnClosure<P, R>,
    x: P,
) -> Result<R> {
    dnc_go(par, trivial, decompose, combine, solve, Placement::PushRand, x).await
}

// ── Map-reduce over an inclusive range ────────────────────────────────────────

/// Both bounds included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusiveRange {
    pub lo: i64,
    pub hi: i64,
}

type MrEnv<A> = (
    i64,
    InclusiveRange,
    ParFnClosure<i64, A>,
    ParFnClosure<(A, A), A>,
    Placement,
);

fn map_reduce_label<A: 'static>() -> String {
    format!("shoal.map_reduce<{}>", type_name::<A>())
}

fn mr_task<A: WireValue>(par: Par, env: MrEnv<A>) -> BoxFuture<'static, Result<Closure<A>>> {
    Box::pin(async move {
        let (threshold, range, f, combine, mode) = env;
        let r = mr_go(&par, threshold, range, &f, &combine, mode).await?;
        Ok(to_closure(&r)?)
    })
}

/// Fold a non-empty range without the caller's `init`: segments seed with
/// their first element, so splitting is sound for any associative combine.
#[async_recursion]
async fn mr_go<A: WireValue>(
    par: &Par,
    threshold: i64,
    range: InclusiveRange,
    f: &ParFnClosure<i64, A>,
    combine: &ParFnClosure<(A, A), A>,
    mode: Placement,
) -> Result<A> {
    if range.hi - range.lo <= threshold {
        let mut acc = (f.thunk()?.0)(par.clone(), range.lo).await?;
        for i in range.lo + 1..=range.hi {
            let fi = (f.thunk()?.0)(par.clone(), i).await?;
            acc = (combine.thunk()?.0)(par.clone(), (acc, fi)).await?;
        }
        return Ok(acc);
    }
    let mid = range.lo + (range.hi - range.lo) / 2;
    let upper = InclusiveRange {
        lo: mid + 1,
        hi: range.hi,
    };
    let clo = spawn_fn_closure(
        map_reduce_label::<A>(),
        mr_task::<A>,
        &(threshold, upper, f.clone(), combine.clone(), mode),
    )?;
    let pending = match mode {
        Placement::Spark => par.spawn(clo)?,
        Placement::PushRand => {
            let nodes = all_nodes()?;
            let node = nodes[rand::thread_rng().gen_range(0..nodes.len())];
            par.spawn_at(clo, node).await?
        }
    };
    let lower = InclusiveRange {
        lo: range.lo,
        hi: mid,
    };
    let left = mr_go(par, threshold, lower, f, combine, mode).await?;
    let right = pending.get().await.value()?;
    (combine.thunk()?.0)(par.clone(), (left, right)).await
}

pub fn register_map_reduce<A: WireValue>() -> Result<()> {
    registry::register_value::<A>()?;
    register_spawnable::<A>()?;
    register_spawn_fn::<MrEnv<A>, A>(map_reduce_label::<A>(), mr_task::<A>)?;
    Ok(())
}

/// Threshold map-reduce over `[lo..=hi]`: segments below the threshold
/// fold sequentially left-to-right; larger ranges split at the midpoint,
/// solving the upper half speculatively (per `mode`) in parallel with the
/// lower half.  Equals the sequential fold of `combine` over
/// `[f lo, …, f hi]` from `init` whenever `combine` is associative.
pub async fn map_reduce_range_thresh<A: WireValue>(
    par: &Par,
    threshold: i64,
    range: InclusiveRange,
    f: &ParFnClosure<i64, A>,
    combine: &ParFnClosure<(A, A), A>,
    init: A,
    mode: Placement,
) -> Result<A> {
    if range.lo > range.hi {
        return Ok(init);
    }
    let total = mr_go(par, threshold.max(0), range, f, combine, mode).await?;
    (combine.thunk()?.0)(par.clone(), (init, total)).await
}
