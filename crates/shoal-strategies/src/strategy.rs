// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Strategies and proto-strategies.

use std::any::type_name;
use std::sync::Arc;

use futures::future::BoxFuture;
use rand::Rng;

use shoal_closure::{registry, Closure, ForceNf, WireForm, WireValue};
use shoal_runtime::{
    register_task_fn, task_closure, GIVar, IVar, NodeId, Par, Result, RtError,
};

/// Thunk of a shippable strategy: `Closure<T> -> Par Closure<T>`.
pub struct StrategyThunk<T>(
    pub Arc<dyn Fn(Par, Closure<T>) -> BoxFuture<'static, Result<Closure<T>>> + Send + Sync>,
);

impl<T> Clone for StrategyThunk<T> {
    fn clone(&self) -> Self {
        StrategyThunk(self.0.clone())
    }
}

/// A strategy as a closure, so list strategies can ship it alongside the
/// data it evaluates.
pub type Strategy<T> = Closure<StrategyThunk<T>>;

/// Apply a strategy: `using(x, s)` is `s x`.
pub async fn using<T: Send + Sync + 'static>(
    par: &Par,
    x: Closure<T>,
    s: &Strategy<T>,
) -> Result<Closure<T>> {
    (s.thunk()?.0)(par.clone(), x).await
}

// ── Sequential basics ─────────────────────────────────────────────────────────

fn r0_label<T: 'static>() -> String {
    format!("shoal.strategy.r0<{}>", type_name::<T>())
}

fn rseq_label<T: 'static>() -> String {
    format!("shoal.strategy.rseq<{}>", type_name::<T>())
}

fn force_label<T: 'static>() -> String {
    format!("shoal.strategy.force<{}>", type_name::<T>())
}

fn rdeepseq_label<T: 'static>() -> String {
    format!("shoal.strategy.rdeepseq<{}>", type_name::<T>())
}

fn r0_thunk<T: Send + Sync + 'static>() -> StrategyThunk<T> {
    StrategyThunk(Arc::new(|_, x| Box::pin(async move { Ok(x) })))
}

fn rseq_thunk<T: Send + Sync + 'static>() -> StrategyThunk<T> {
    StrategyThunk(Arc::new(|_, x| {
        Box::pin(async move {
            x.thunk()?;
            Ok(x)
        })
    }))
}

fn force_thunk<T: WireValue>() -> StrategyThunk<T> {
    StrategyThunk(Arc::new(|_, x| Box::pin(async move { Ok(x.force()?) })))
}

fn rdeepseq_thunk<T: WireValue + ForceNf>() -> StrategyThunk<T> {
    StrategyThunk(Arc::new(|_, x| Box::pin(async move { Ok(x.force_nf()?) })))
}

/// Do nothing.
pub fn r0<T: Send + Sync + 'static>() -> Strategy<T> {
    Closure::with_thunk(
        WireForm {
            label: r0_label::<T>(),
            payload: Vec::new(),
        },
        r0_thunk(),
    )
}

/// Materialise the thunk (head-normal evaluation).
pub fn rseq<T: Send + Sync + 'static>() -> Strategy<T> {
    Closure::with_thunk(
        WireForm {
            label: rseq_label::<T>(),
            payload: Vec::new(),
        },
        rseq_thunk(),
    )
}

/// Evaluate to normal form and rewrite the wire form to the value encoding
/// — the strategy of choice before results travel home.
pub fn force_cc<T: WireValue>() -> Strategy<T> {
    Closure::with_thunk(
        WireForm {
            label: force_label::<T>(),
            payload: Vec::new(),
        },
        force_thunk(),
    )
}

/// Full normal-form evaluation.
///
/// [`force_cc`] rewrites only the outer closure's wire form; a payload
/// shaped like `Vec<Closure<U>>` would still carry unevaluated inner
/// recipes.  `rdeepseq` forces embedded closures recursively through
/// [`ForceNf`], so the result serialises with no recipe left anywhere.
/// For flat element types the two agree.
pub fn rdeepseq<T: WireValue + ForceNf>() -> Strategy<T> {
    Closure::with_thunk(
        WireForm {
            label: rdeepseq_label::<T>(),
            payload: Vec::new(),
        },
        rdeepseq_thunk(),
    )
}

// ── Proto-strategies ──────────────────────────────────────────────────────────

fn eval_wrapper_label<T: 'static>() -> String {
    format!("shoal.strategy.eval<{}>", type_name::<T>())
}

type EvalEnv<T> = (Closure<T>, Strategy<T>, GIVar<T>);

/// The shipped body of both proto-strategies: evaluate the payload closure
/// under the shipped strategy, then write the result through the global
/// handle.
fn eval_wrapper<T: WireValue>(par: Par, env: EvalEnv<T>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let (x, s, gv) = env;
        let y = using(&par, x, &s).await?;
        par.rput(&gv, y).await
    })
}

/// Everything strategies need for element type `T`: the value encoding,
/// the sequential strategies, and the evaluation wrapper.  Call once per
/// element type before the registry seals.
pub fn register_strategies<T: WireValue>() -> Result<()> {
    registry::register_value::<T>()?;
    registry::ensure(r0_label::<T>(), || {
        Box::new(|_bytes| Ok(Box::new(r0_thunk::<T>())))
    })?;
    registry::ensure(rseq_label::<T>(), || {
        Box::new(|_bytes| Ok(Box::new(rseq_thunk::<T>())))
    })?;
    registry::ensure(force_label::<T>(), || {
        Box::new(|_bytes| Ok(Box::new(force_thunk::<T>())))
    })?;
    register_task_fn::<EvalEnv<T>>(eval_wrapper_label::<T>(), eval_wrapper::<T>)?;
    Ok(())
}

/// [`register_strategies`] plus full normal-form evaluation, for element
/// types whose embedded closures [`rdeepseq`] can reach via [`ForceNf`].
pub fn register_nf_strategies<T: WireValue + ForceNf>() -> Result<()> {
    register_strategies::<T>()?;
    registry::ensure(rdeepseq_label::<T>(), || {
        Box::new(|_bytes| Ok(Box::new(rdeepseq_thunk::<T>())))
    })?;
    Ok(())
}

/// Spark the evaluation of `x` under `s`; any node may pick it up.  The
/// returned cell fills with the evaluated closure.
pub fn spark_closure<T: WireValue>(
    par: &Par,
    s: &Strategy<T>,
    x: Closure<T>,
) -> Result<IVar<Closure<T>>> {
    let cell = IVar::new();
    let gv = par.glob(&cell)?;
    let wrapper = task_closure(
        eval_wrapper_label::<T>(),
        eval_wrapper::<T>,
        &(x, s.clone(), gv),
    )?;
    par.spark(wrapper);
    Ok(cell)
}

/// As [`spark_closure`], but with eager placement on `node`.
pub async fn push_closure<T: WireValue>(
    par: &Par,
    s: &Strategy<T>,
    node: NodeId,
    x: Closure<T>,
) -> Result<IVar<Closure<T>>> {
    let cell = IVar::new();
    let gv = par.glob(&cell)?;
    let wrapper = task_closure(
        eval_wrapper_label::<T>(),
        eval_wrapper::<T>,
        &(x, s.clone(), gv),
    )?;
    par.push_to(wrapper, node).await?;
    Ok(cell)
}

// ── List strategies ───────────────────────────────────────────────────────────

/// Spark every element, then collect in input order.
pub async fn par_closure_list<T: WireValue>(
    par: &Par,
    s: &Strategy<T>,
    xs: Vec<Closure<T>>,
) -> Result<Vec<Closure<T>>> {
    let mut cells = Vec::with_capacity(xs.len());
    for x in xs {
        cells.push(spark_closure(par, s, x)?);
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        out.push(cell.get().await);
    }
    Ok(out)
}

/// Push elements at `nodes`, cycled round-robin; collect in input order.
pub async fn push_closure_list<T: WireValue>(
    par: &Par,
    s: &Strategy<T>,
    nodes: &[NodeId],
    xs: Vec<Closure<T>>,
) -> Result<Vec<Closure<T>>> {
    if nodes.is_empty() {
        return Err(RtError::Config("push_closure_list needs target nodes".to_string()));
    }
    let mut cells = Vec::with_capacity(xs.len());
    for (i, x) in xs.into_iter().enumerate() {
        cells.push(push_closure(par, s, nodes[i % nodes.len()], x).await?);
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        out.push(cell.get().await);
    }
    Ok(out)
}

/// Push every element at a uniformly random node from `nodes`.
pub async fn push_rand_closure_list<T: WireValue>(
    par: &Par,
    s: &Strategy<T>,
    nodes: &[NodeId],
    xs: Vec<Closure<T>>,
) -> Result<Vec<Closure<T>>> {
    if nodes.is_empty() {
        return Err(RtError::Config("push_rand_closure_list needs target nodes".to_string()));
    }
    let mut cells = Vec::with_capacity(xs.len());
    for x in xs {
        let node = nodes[rand::thread_rng().gen_range(0..nodes.len())];
        cells.push(push_closure(par, s, node, x).await?);
    }
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        out.push(cell.get().await);
    }
    Ok(out)
}
