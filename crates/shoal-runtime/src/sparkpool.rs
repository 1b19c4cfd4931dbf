// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The node-wide spark pool: stealable, speculatively parallel work.
//!
//! Local conversion pops the newest spark; steals take the oldest, so the
//! work most likely to be large leaves first.  Producers are local sparking
//! and the dispatcher (stolen sparks arriving via SCHEDULE); consumers are
//! the spark runners and the FISH handler.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::par::ParClosure;

#[derive(Default)]
pub(crate) struct SparkPool {
    q: Mutex<VecDeque<ParClosure>>,
    /// Signalled whenever the pool may have changed in a way an idle runner
    /// cares about: a spark arrived, or a fish came back empty.
    pub stirred: Notify,
}

impl SparkPool {
    pub fn push(&self, spark: ParClosure) {
        self.q.lock().expect("spark pool lock poisoned").push_back(spark);
        self.stirred.notify_waiters();
    }

    /// Newest spark, for local conversion.
    pub fn pop_local(&self) -> Option<ParClosure> {
        self.q.lock().expect("spark pool lock poisoned").pop_back()
    }

    /// Oldest spark, for a fisher.  One atomic take per steal transaction.
    pub fn steal(&self) -> Option<ParClosure> {
        self.q.lock().expect("spark pool lock poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.q.lock().expect("spark pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_closure::{Closure, WireForm};

    fn spark(tag: &str) -> ParClosure {
        Closure::from_wire(WireForm {
            label: tag.to_string(),
            payload: vec![],
        })
    }

    #[test]
    fn local_pop_is_lifo_steal_is_fifo() {
        let pool = SparkPool::default();
        pool.push(spark("a"));
        pool.push(spark("b"));
        pool.push(spark("c"));

        assert_eq!(pool.steal().unwrap().label(), "a");
        assert_eq!(pool.pop_local().unwrap().label(), "c");
        assert_eq!(pool.pop_local().unwrap().label(), "b");
        assert!(pool.pop_local().is_none());
        assert!(pool.steal().is_none());
    }

    #[tokio::test]
    async fn push_wakes_a_waiting_runner() {
        let pool = std::sync::Arc::new(SparkPool::default());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let wake = pool.stirred.notified();
                tokio::pin!(wake);
                if pool.is_empty() {
                    wake.await;
                }
                pool.pop_local().is_some()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        pool.push(spark("wake"));
        assert!(waiter.await.unwrap());
    }
}
