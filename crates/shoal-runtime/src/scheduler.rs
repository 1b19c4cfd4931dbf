// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The node scheduler: spark runners, the message dispatcher, the fishing
//! protocol, and distributed termination.
//!
//! [`run_par`] owns a node's whole lifetime.  It seals the static table,
//! brings up the mesh, starts `num_workers` spark runners, and then either
//! runs the user program (main node) or serves the dispatcher until
//! SHUTDOWN (everyone else).  Termination is a quiescence probe circling
//! the node ring from the main node: when two consecutive rounds report no
//! active work and matching work-message counters, the cluster is done.

use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};

use shoal_closure::registry;
use shoal_config::RuntimeConfig;

use crate::comm::{self, Inbound};
use crate::error::{Result, RtError};
use crate::givar;
use crate::location::{self, level, NodeId};
use crate::message::{Msg, QuiesceProbe};
use crate::par::{fatal, run_task, Par, ParClosure, RtState};
use crate::rt_debug;
use crate::sparkpool::SparkPool;
use crate::stats::Counters;

/// Run a user program on this node's scheduler, blocking until the whole
/// cluster terminates.
///
/// `main_fn` runs only on the main node; its result is returned as
/// `Some(..)` there and `None` on every other node.  The static table must
/// be fully populated before this call — it is sealed here.
pub fn run_par<T, F, Fut>(cfg: RuntimeConfig, main_fn: F) -> Result<Option<T>>
where
    F: FnOnce(Par) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    cfg.validate().map_err(RtError::Config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.num_workers.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run_par_inner(cfg, main_fn))
}

async fn run_par_inner<T, F, Fut>(cfg: RuntimeConfig, main_fn: F) -> Result<Option<T>>
where
    F: FnOnce(Par) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    location::set_debug_level(cfg.debug_level);
    registry::seal();

    let counters = Arc::new(Counters::default());
    let (comm, inbound_rx, pending) = comm::establish(&cfg, counters.clone()).await?;

    if location::is_main()? {
        rt_debug!(
            level::STATIC_TABLE,
            "static table ({} entries): {:?}",
            registry::labels().len(),
            registry::labels()
        );
    }

    let (shutdown_tx, _) = watch::channel(false);
    let now = tokio::time::Instant::now();
    let last_seen = location::peers()?
        .into_iter()
        .map(|p| (p, now))
        .collect();
    let rt = Arc::new(RtState {
        fish_permits: Semaphore::new(cfg.max_fish),
        cfg,
        comm,
        pool: SparkPool::default(),
        counters,
        active_tasks: Default::default(),
        shutdown_tx,
        quiesce_reply: Default::default(),
        failure: Default::default(),
        last_seen: std::sync::Mutex::new(last_seen),
    });
    let par = Par::new(rt.clone());

    tokio::spawn(dispatch_loop(par.clone(), inbound_rx, pending));
    if rt.comm.link_count() > 0 {
        tokio::spawn(heartbeat_loop(rt.clone()));
        tokio::spawn(failure_detector(rt.clone()));
    }
    if rt.cfg.chaos_monkey {
        tokio::spawn(chaos_monkey(rt.clone()));
    }
    for idx in 0..rt.cfg.num_workers {
        tokio::spawn(spark_runner(par.clone(), idx));
    }

    let result = if location::is_main()? {
        match main_fn(par.clone()).await {
            Ok(value) => {
                terminate(&par).await?;
                Some(value)
            }
            Err(e) => {
                fatal(&rt, e);
                None
            }
        }
    } else {
        wait_for_shutdown(&rt).await;
        None
    };

    epilogue(&rt)?;
    Ok(result)
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

async fn dispatch_loop(par: Par, mut rx: mpsc::Receiver<Inbound>, pending: Vec<Inbound>) {
    let mut shutdown = par.rt.shutdown_tx.subscribe();
    for ev in pending {
        if matches!(handle_event(&par, ev).await, ControlFlow::Break(())) {
            return;
        }
    }
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => {
                    if matches!(handle_event(&par, ev).await, ControlFlow::Break(())) {
                        return;
                    }
                }
                None => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn handle_event(par: &Par, ev: Inbound) -> ControlFlow<()> {
    match ev {
        Inbound::Lost(peer, err) => {
            if par.rt.comm.closing.load(Ordering::Relaxed) {
                return ControlFlow::Break(());
            }
            rt_debug!(level::FAILURE, "node failure: {peer} ({err})");
            fatal(&par.rt, RtError::PeerUnreachable(format!("{peer}: {err}")));
            ControlFlow::Break(())
        }
        Inbound::Msg(from, msg) => {
            let shutting_down = matches!(msg, Msg::Shutdown);
            if let Err(e) = handle_msg(par, from, msg).await {
                fatal(&par.rt, e);
                return ControlFlow::Break(());
            }
            if shutting_down {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }
}

/// Handlers are short and never `get`: they may fork tasks, move sparks,
/// and reply, nothing more.
async fn handle_msg(par: &Par, from: NodeId, msg: Msg) -> Result<()> {
    let rt = &par.rt;
    rt.counters.msgs_received.fetch_add(1, Ordering::Relaxed);
    if msg.bears_work() {
        rt.counters.work_received.fetch_add(1, Ordering::Relaxed);
    }
    rt_debug!(level::MSG_RECV, "<- {from} {}", msg.kind());
    if let Ok(mut seen) = rt.last_seen.lock() {
        seen.insert(from, tokio::time::Instant::now());
    }

    match msg {
        Msg::Fish { fisher } => match rt.pool.steal() {
            Some(spark) => {
                rt_debug!(level::SPARK, "spark stolen by {fisher}");
                rt.comm
                    .send(
                        fisher,
                        Msg::Schedule {
                            fisher,
                            spark: spark.wire().clone(),
                        },
                    )
                    .await?;
            }
            None => rt.comm.send(fisher, Msg::NoWork { fisher }).await?,
        },
        Msg::Schedule { spark, .. } => {
            rt_debug!(level::SPARK, "stolen spark arrived ({})", spark.label);
            rt.pool.push(ParClosure::from_wire(spark));
        }
        Msg::NoWork { .. } => {
            rt.counters.nowork_received.fetch_add(1, Ordering::Relaxed);
            // Wake the fisher so it backs off instead of waiting out the
            // reply window.
            rt.pool.stirred.notify_waiters();
        }
        Msg::Execute { task } => {
            let clo = ParClosure::from_wire(task);
            let task_par = par.clone();
            par.fork(async move { run_task(task_par, clo).await });
        }
        Msg::RPut { slot, value } => {
            rt_debug!(level::GIVAR, "rput <- {from} slot {slot}");
            givar::write_remote(slot, value)?;
        }
        Msg::Quiesce { mut probe } => {
            probe.hops += 1;
            probe.sent += rt.counters.work_sent.load(Ordering::Relaxed);
            probe.received += rt.counters.work_received.load(Ordering::Relaxed);
            probe.active +=
                rt.pool.len() as u64 + rt.active_tasks.load(Ordering::SeqCst);
            let n = location::all_nodes()?.len();
            if location::is_main()? && probe.hops as usize >= n {
                if let Some(tx) = rt
                    .quiesce_reply
                    .lock()
                    .expect("quiesce slot lock poisoned")
                    .take()
                {
                    let _ = tx.send(probe);
                }
            } else {
                rt.comm.send(next_in_ring()?, Msg::Quiesce { probe }).await?;
            }
        }
        Msg::Shutdown => {
            rt.comm.closing.store(true, Ordering::Relaxed);
            let _ = rt.shutdown_tx.send(true);
        }
        Msg::Heartbeat { .. } => {}
        Msg::Hello { .. } | Msg::NodeList { .. } => {
            return Err(RtError::WireDecode(format!(
                "startup frame {} after startup",
                msg.kind()
            )));
        }
    }
    Ok(())
}

// ── Spark runners and fishing ─────────────────────────────────────────────────

/// How long a runner executes a converted spark inline before detaching
/// it.  Short sparks finish inline, keeping conversion throttled by worker
/// availability; blocked sparks stop occupying their runner.
const DETACH_AFTER: Duration = Duration::from_millis(1);

async fn spark_runner(par: Par, _idx: usize) {
    let rt = par.rt.clone();
    let mut shutdown = rt.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            return;
        }
        if let Some(spark) = rt.pool.pop_local() {
            rt.counters.sparks_converted.fetch_add(1, Ordering::Relaxed);
            rt_debug!(level::SPARK, "converting spark ({})", spark.label());
            rt.active_tasks.fetch_add(1, Ordering::SeqCst);
            let mut task = Box::pin(run_task(par.clone(), spark));
            tokio::select! {
                outcome = &mut task => {
                    rt.active_tasks.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = outcome {
                        fatal(&rt, e);
                        return;
                    }
                }
                _ = tokio::time::sleep(DETACH_AFTER) => {
                    // The task is long-running or blocked on a cell.
                    // Detach it so this runner keeps converting sparks —
                    // otherwise recursive skeletons deeper than the worker
                    // count would wedge the pool.
                    let rt = rt.clone();
                    tokio::spawn(async move {
                        let outcome = task.await;
                        rt.active_tasks.fetch_sub(1, Ordering::SeqCst);
                        if let Err(e) = outcome {
                            fatal(&rt, e);
                        }
                    });
                }
            }
            continue;
        }
        let peers = match location::peers() {
            Ok(p) => p,
            Err(e) => {
                fatal(&rt, e);
                return;
            }
        };
        if peers.is_empty() {
            let wake = rt.pool.stirred.notified();
            tokio::pin!(wake);
            if rt.pool.is_empty() {
                tokio::select! {
                    _ = &mut wake => {}
                    _ = shutdown.changed() => {}
                }
            }
        } else {
            fish_once(&par, &peers, &mut shutdown).await;
        }
    }
}

/// One round of the fishing protocol: pick a victim, send FISH, and wait
/// for the pool to stir (a SCHEDULE arrived, or NOWORK told us to back
/// off).  Each runner keeps at most one fish in flight; `max_fish` bounds
/// the node as a whole.
async fn fish_once(par: &Par, peers: &[NodeId], shutdown: &mut watch::Receiver<bool>) {
    let rt = &par.rt;
    let reply_window = Duration::from_millis(rt.cfg.fish_delay_max_ms.max(1) * 4);

    let permit = match rt.fish_permits.try_acquire() {
        Ok(p) => p,
        Err(_) => {
            // The node is already fishing at capacity; wait for news.
            let wake = rt.pool.stirred.notified();
            tokio::pin!(wake);
            if rt.pool.is_empty() {
                tokio::select! {
                    _ = &mut wake => {}
                    _ = tokio::time::sleep(reply_window) => {}
                    _ = shutdown.changed() => {}
                }
            }
            return;
        }
    };

    let me = match location::my_node() {
        Ok(me) => me,
        Err(e) => {
            fatal(rt, e);
            return;
        }
    };
    let victim = peers[rand::thread_rng().gen_range(0..peers.len())];
    rt.counters.fishes_sent.fetch_add(1, Ordering::Relaxed);

    // Arm the wakeup before sending so a fast SCHEDULE cannot slip past.
    let wake = rt.pool.stirred.notified();
    tokio::pin!(wake);
    if let Err(e) = rt.comm.send(victim, Msg::Fish { fisher: me }).await {
        drop(permit);
        fatal(rt, e);
        return;
    }
    tokio::select! {
        _ = &mut wake => {}
        _ = tokio::time::sleep(reply_window) => {}
        _ = shutdown.changed() => {}
    }
    drop(permit);

    if rt.pool.is_empty() && !*shutdown.borrow() {
        let delay = rand::thread_rng()
            .gen_range(rt.cfg.fish_delay_min_ms..=rt.cfg.fish_delay_max_ms.max(rt.cfg.fish_delay_min_ms));
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            _ = shutdown.changed() => {}
        }
    }
}

// ── Liveness ──────────────────────────────────────────────────────────────────

async fn heartbeat_loop(rt: Arc<RtState>) {
    let mut shutdown = rt.shutdown_tx.subscribe();
    let mut tick = tokio::time::interval(Duration::from_millis(rt.cfg.heartbeat_interval_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                seq += 1;
                if rt.comm.broadcast(Msg::Heartbeat { seq }).await.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn failure_detector(rt: Arc<RtState>) {
    let mut shutdown = rt.shutdown_tx.subscribe();
    let interval = Duration::from_millis(rt.cfg.heartbeat_interval_ms.max(1));
    let allowance = interval * rt.cfg.heartbeat_misses.max(1);
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = tokio::time::Instant::now();
                let silent = rt
                    .last_seen
                    .lock()
                    .expect("last_seen lock poisoned")
                    .iter()
                    .find(|(_, last)| now.duration_since(**last) > allowance)
                    .map(|(peer, _)| *peer);
                if let Some(peer) = silent {
                    rt_debug!(level::FAILURE, "node failure: {peer} (heartbeats missed)");
                    fatal(&rt, RtError::PeerUnreachable(format!("{peer}: heartbeats missed")));
                    return;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Fault injection: abort this node at a random point in the first 30
/// seconds, exercising the peers' failure detection.
async fn chaos_monkey(rt: Arc<RtState>) {
    let delay = Duration::from_millis(rand::thread_rng().gen_range(0..30_000));
    tokio::time::sleep(delay).await;
    rt_debug!(level::FAILURE, "chaos monkey strikes after {delay:?}");
    let node = location::try_my_node()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "<unset>".to_string());
    tracing::error!(target: "shoal", node = %node, "chaos monkey: aborting node");
    drop(rt);
    std::process::exit(70);
}

// ── Termination ───────────────────────────────────────────────────────────────

fn next_in_ring() -> Result<NodeId> {
    let nodes = location::all_nodes()?;
    let me = location::my_node()?;
    let idx = nodes
        .iter()
        .position(|n| *n == me)
        .ok_or_else(|| RtError::Internal("this node is missing from the node list".to_string()))?;
    Ok(nodes[(idx + 1) % nodes.len()])
}

async fn wait_local_idle(rt: &Arc<RtState>) {
    loop {
        if rt.pool.is_empty() && rt.active_tasks.load(Ordering::SeqCst) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Main-node termination: wait for distributed quiescence, then broadcast
/// SHUTDOWN.  Every counter sample happens inside a node's dispatcher, so
/// per-node samples are serialised against its own message handling.
async fn terminate(par: &Par) -> Result<()> {
    let rt = &par.rt;
    if location::all_nodes()?.len() > 1 {
        let mut prev: Option<QuiesceProbe> = None;
        loop {
            wait_local_idle(rt).await;
            let (tx, rx) = oneshot::channel();
            *rt
                .quiesce_reply
                .lock()
                .expect("quiesce slot lock poisoned") = Some(tx);
            let probe = QuiesceProbe {
                hops: 0,
                sent: 0,
                received: 0,
                active: 0,
            };
            rt.comm.send(next_in_ring()?, Msg::Quiesce { probe }).await?;
            let done = rx
                .await
                .map_err(|_| RtError::Internal("quiescence probe lost".to_string()))?;
            let idle = done.active == 0 && done.sent == done.received;
            let stable = prev
                .map(|p| p.sent == done.sent && p.received == done.received)
                .unwrap_or(false);
            if idle && stable {
                break;
            }
            prev = Some(done);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    } else {
        // Single node: nothing can be in flight once the pool and the task
        // count are simultaneously empty twice in a row.
        wait_local_idle(rt).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        wait_local_idle(rt).await;
    }
    rt.comm.closing.store(true, Ordering::Relaxed);
    rt.comm.broadcast(Msg::Shutdown).await?;
    let _ = rt.shutdown_tx.send(true);
    Ok(())
}

async fn wait_for_shutdown(rt: &Arc<RtState>) {
    let mut rx = rt.shutdown_tx.subscribe();
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn epilogue(rt: &Arc<RtState>) -> Result<()> {
    rt.comm.closing.store(true, Ordering::Relaxed);
    if let Some(err) = rt
        .failure
        .lock()
        .expect("failure slot lock poisoned")
        .take()
    {
        return Err(err);
    }
    let outstanding = givar::outstanding_slots();
    if !outstanding.is_empty() {
        rt_debug!(
            level::FAILURE,
            "unresolved globalised cells at shutdown: {outstanding:?}"
        );
        return Err(RtError::TerminationViolation(outstanding.len()));
    }
    rt_debug!(level::STATS, "final stats: {}", rt.counters.snapshot());
    Ok(())
}
