// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The task monad: a cheap-to-clone handle through which tasks create
//! cells, fork local work, spark stealable work, and place work on peers.
//!
//! Tasks are futures; suspension happens at `get` on an empty cell and at
//! the explicit scheduling points (`fork`, `spark`, `push_to`).  Shippable
//! tasks are closures whose thunks take the local `Par` handle, so the same
//! registered code runs identically wherever it lands.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::{oneshot, watch, Semaphore};

use shoal_closure::{codec, registry, Closure, WireForm, WireValue};
use shoal_config::RuntimeConfig;

use crate::comm::Comm;
use crate::error::{Result, RtError};
use crate::givar::{self, GIVar};
use crate::ivar::IVar;
use crate::location::{self, level, NodeId};
use crate::message::{Msg, QuiesceProbe};
use crate::rt_debug;
use crate::sparkpool::SparkPool;
use crate::stats::Counters;

// ── Shippable task thunks ─────────────────────────────────────────────────────

/// Thunk of a shippable `Par ()` task.
pub struct ParThunk(pub Arc<dyn Fn(Par) -> BoxFuture<'static, Result<()>> + Send + Sync>);

impl Clone for ParThunk {
    fn clone(&self) -> Self {
        ParThunk(self.0.clone())
    }
}

/// A closure executable by any scheduler in the cluster: what sparks, and
/// the payload of EXECUTE messages.
pub type ParClosure = Closure<ParThunk>;

/// Thunk of a shippable monadic function `A -> Par B`.
pub struct ParFnThunk<A, B>(
    pub Arc<dyn Fn(Par, A) -> BoxFuture<'static, Result<B>> + Send + Sync>,
);

impl<A, B> Clone for ParFnThunk<A, B> {
    fn clone(&self) -> Self {
        ParFnThunk(self.0.clone())
    }
}

pub type ParFnClosure<A, B> = Closure<ParFnThunk<A, B>>;

/// Thunk of a shippable task that produces a value closure, the shape
/// [`Par::spawn`] consumes.
pub struct ParValThunk<T>(
    pub Arc<dyn Fn(Par) -> BoxFuture<'static, Result<Closure<T>>> + Send + Sync>,
);

impl<T> Clone for ParValThunk<T> {
    fn clone(&self) -> Self {
        ParValThunk(self.0.clone())
    }
}

pub type SpawnClosure<T> = Closure<ParValThunk<T>>;

// ── Registration helpers ──────────────────────────────────────────────────────

/// Register a task function with a serialisable environment.  The matching
/// [`task_closure`] call builds shippable `Par ()` closures over it.
pub fn register_task_fn<E: WireValue>(
    label: impl Into<String>,
    f: fn(Par, E) -> BoxFuture<'static, Result<()>>,
) -> Result<()> {
    registry::ensure(label, || {
        Box::new(move |bytes| {
            let env: E = codec::decode(bytes)?;
            Ok(Box::new(ParThunk(Arc::new(move |par| f(par, env.clone())))))
        })
    })?;
    Ok(())
}

pub fn task_closure<E: WireValue>(
    label: impl Into<String>,
    f: fn(Par, E) -> BoxFuture<'static, Result<()>>,
    env: &E,
) -> Result<ParClosure> {
    let wire = WireForm {
        label: label.into(),
        payload: codec::encode(env)?,
    };
    let captured = env.clone();
    Ok(Closure::with_thunk(
        wire,
        ParThunk(Arc::new(move |par| f(par, captured.clone()))),
    ))
}

/// Register a monadic function `A -> Par B` with no captured environment.
pub fn register_par_fn<A, B>(
    label: impl Into<String>,
    f: fn(Par, A) -> BoxFuture<'static, Result<B>>,
) -> Result<()>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    registry::ensure(label, || {
        Box::new(move |_bytes| {
            Ok(Box::new(ParFnThunk::<A, B>(Arc::new(f))))
        })
    })?;
    Ok(())
}

pub fn par_fn_closure<A, B>(
    label: impl Into<String>,
    f: fn(Par, A) -> BoxFuture<'static, Result<B>>,
) -> ParFnClosure<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    Closure::with_thunk(
        WireForm {
            label: label.into(),
            payload: Vec::new(),
        },
        ParFnThunk(Arc::new(f)),
    )
}

/// Register a monadic function `A -> Par B` closing over a serialisable
/// environment.
pub fn register_par_fn_env<E, A, B>(
    label: impl Into<String>,
    f: fn(Par, E, A) -> BoxFuture<'static, Result<B>>,
) -> Result<()>
where
    E: WireValue,
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    registry::ensure(label, || {
        Box::new(move |bytes| {
            let env: E = codec::decode(bytes)?;
            Ok(Box::new(ParFnThunk::<A, B>(Arc::new(move |par, a| {
                f(par, env.clone(), a)
            }))))
        })
    })?;
    Ok(())
}

pub fn par_fn_env_closure<E, A, B>(
    label: impl Into<String>,
    f: fn(Par, E, A) -> BoxFuture<'static, Result<B>>,
    env: &E,
) -> Result<ParFnClosure<A, B>>
where
    E: WireValue,
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    let wire = WireForm {
        label: label.into(),
        payload: codec::encode(env)?,
    };
    let captured = env.clone();
    Ok(Closure::with_thunk(
        wire,
        ParFnThunk(Arc::new(move |par, a| f(par, captured.clone(), a))),
    ))
}

/// Register a result-producing task with a serialisable environment,
/// yielding closures for [`Par::spawn`] / [`Par::spawn_at`].
pub fn register_spawn_fn<E: WireValue, T: Send + Sync + 'static>(
    label: impl Into<String>,
    f: fn(Par, E) -> BoxFuture<'static, Result<Closure<T>>>,
) -> Result<()> {
    registry::ensure(label, || {
        Box::new(move |bytes| {
            let env: E = codec::decode(bytes)?;
            Ok(Box::new(ParValThunk::<T>(Arc::new(move |par| {
                f(par, env.clone())
            }))))
        })
    })?;
    Ok(())
}

pub fn spawn_fn_closure<E: WireValue, T: Send + Sync + 'static>(
    label: impl Into<String>,
    f: fn(Par, E) -> BoxFuture<'static, Result<Closure<T>>>,
    env: &E,
) -> Result<SpawnClosure<T>> {
    let wire = WireForm {
        label: label.into(),
        payload: codec::encode(env)?,
    };
    let captured = env.clone();
    Ok(Closure::with_thunk(
        wire,
        ParValThunk(Arc::new(move |par| f(par, captured.clone()))),
    ))
}

// ── Spawn wrapper ─────────────────────────────────────────────────────────────

fn spawn_wrapper_label<T: 'static>() -> String {
    format!("shoal.spawn<{}>", type_name::<T>())
}

fn spawn_wrapper<T: WireValue>(
    par: Par,
    env: (SpawnClosure<T>, GIVar<T>),
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let (clo, gv) = env;
        let result = (clo.thunk()?.0)(par.clone()).await?;
        par.rput(&gv, result).await
    })
}

/// Register the result-writing wrapper [`Par::spawn`] sparks for `T`.
/// Call once per spawned result type, before the registry seals.
pub fn register_spawnable<T: WireValue>() -> Result<()> {
    register_task_fn::<(SpawnClosure<T>, GIVar<T>)>(spawn_wrapper_label::<T>(), spawn_wrapper::<T>)
}

// ── Runtime state and the Par handle ──────────────────────────────────────────

pub(crate) struct RtState {
    pub cfg: RuntimeConfig,
    pub comm: Comm,
    pub pool: SparkPool,
    pub counters: Arc<Counters>,
    /// Forked tasks plus sparks currently being converted.
    pub active_tasks: AtomicU64,
    pub fish_permits: Semaphore,
    pub shutdown_tx: watch::Sender<bool>,
    pub quiesce_reply: Mutex<Option<oneshot::Sender<QuiesceProbe>>>,
    pub failure: Mutex<Option<RtError>>,
    pub last_seen: Mutex<HashMap<NodeId, tokio::time::Instant>>,
}

/// Record the first fatal error, then tear the computation down: local
/// shutdown plus a SHUTDOWN broadcast so peers exit too.
pub(crate) fn fatal(rt: &Arc<RtState>, err: RtError) {
    let node = location::try_my_node()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "<unset>".to_string());
    tracing::error!(target: "shoal", node = %node, error = %err, "fatal error, aborting computation");
    rt_debug!(level::FAILURE, "fatal: {err}");
    {
        let mut slot = rt.failure.lock().expect("failure slot lock poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }
    rt.comm.closing.store(true, Ordering::Relaxed);
    let _ = rt.shutdown_tx.send(true);
    let rt = rt.clone();
    tokio::spawn(async move {
        let _ = rt.comm.broadcast(Msg::Shutdown).await;
    });
}

/// Run a shippable task closure to completion on this scheduler.
pub(crate) async fn run_task(par: Par, clo: ParClosure) -> Result<()> {
    let thunk = clo.thunk()?.clone();
    (thunk.0)(par).await
}

/// Handle to the running scheduler.  Clones are cheap and share the node's
/// runtime state.
#[derive(Clone)]
pub struct Par {
    pub(crate) rt: Arc<RtState>,
}

impl Par {
    pub(crate) fn new(rt: Arc<RtState>) -> Self {
        Par { rt }
    }

    /// This node's identity.
    pub fn here(&self) -> Result<NodeId> {
        location::my_node()
    }

    /// Push a task onto this node's scheduler; the current task continues.
    /// A task error is fatal for the whole computation.
    pub fn fork<F>(&self, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let rt = self.rt.clone();
        rt.counters.tasks_forked.fetch_add(1, Ordering::Relaxed);
        rt.active_tasks.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                fatal(&rt, e);
            }
            rt.active_tasks.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Put a task closure into the spark pool, where any node may steal it.
    pub fn spark(&self, clo: ParClosure) {
        self.rt.counters.sparks_created.fetch_add(1, Ordering::Relaxed);
        rt_debug!(level::SPARK, "spark created ({})", clo.label());
        self.rt.pool.push(clo);
    }

    /// Eager placement: run `clo` on `node`.  The target always accepts and
    /// forks the task on an arbitrary worker.
    pub async fn push_to(&self, clo: ParClosure, node: NodeId) -> Result<()> {
        if node == location::my_node()? {
            let par = self.clone();
            self.fork(async move { run_task(par, clo).await });
            Ok(())
        } else {
            self.rt
                .comm
                .send(node, Msg::Execute { task: clo.wire().clone() })
                .await
        }
    }

    /// Allocate a result cell, globalise it, and spark a task that writes
    /// `clo`'s result through the global handle.
    pub fn spawn<T: WireValue>(&self, clo: SpawnClosure<T>) -> Result<IVar<Closure<T>>> {
        let cell = IVar::new();
        let gv = givar::glob(&cell)?;
        let wrapper = task_closure(spawn_wrapper_label::<T>(), spawn_wrapper::<T>, &(clo, gv))?;
        self.spark(wrapper);
        Ok(cell)
    }

    /// As [`Par::spawn`], but with eager placement on `node`.
    pub async fn spawn_at<T: WireValue>(
        &self,
        clo: SpawnClosure<T>,
        node: NodeId,
    ) -> Result<IVar<Closure<T>>> {
        let cell = IVar::new();
        let gv = givar::glob(&cell)?;
        let wrapper = task_closure(spawn_wrapper_label::<T>(), spawn_wrapper::<T>, &(clo, gv))?;
        self.push_to(wrapper, node).await?;
        Ok(cell)
    }

    /// Globalise a local cell.
    pub fn glob<T: WireValue>(&self, cell: &IVar<Closure<T>>) -> Result<GIVar<T>> {
        givar::glob(cell)
    }

    /// Write through a global handle: locally when this node owns the cell,
    /// otherwise via an RPUT message to the owner.
    pub async fn rput<T: WireValue>(&self, gv: &GIVar<T>, value: Closure<T>) -> Result<()> {
        if gv.owner() == location::my_node()? {
            givar::write_local(gv, value)
        } else {
            rt_debug!(level::GIVAR, "rput -> {} slot {}", gv.owner(), gv.slot());
            self.rt
                .comm
                .send(
                    gv.owner(),
                    Msg::RPut {
                        slot: gv.slot(),
                        value: value.wire().clone(),
                    },
                )
                .await
        }
    }
}
