// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local single-assignment cells.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{Result, RtError};
use crate::location::level;
use crate::rt_debug;

enum State<T> {
    Empty { waiters: Vec<oneshot::Sender<()>> },
    Full(T),
}

/// A write-once cell with blocking reads.
///
/// `put` transitions Empty → Full and wakes every waiter; a second `put` is
/// the fatal `DoublePut` error.  `get` suspends the calling task until the
/// cell fills.  Clones share the cell.
pub struct IVar<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for IVar<T> {
    fn clone(&self) -> Self {
        IVar {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for IVar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> IVar<T> {
    pub fn new() -> Self {
        IVar {
            inner: Arc::new(Mutex::new(State::Empty {
                waiters: Vec::new(),
            })),
        }
    }

    /// Fill the cell, waking all waiters.  Exactly one `put` (local or via
    /// a globalised handle) may succeed per cell.
    pub fn put(&self, value: T) -> Result<()> {
        let waiters = {
            let mut state = self.inner.lock().expect("ivar lock poisoned");
            match &mut *state {
                State::Full(_) => return Err(RtError::DoublePut),
                State::Empty { waiters } => {
                    let taken = std::mem::take(waiters);
                    *state = State::Full(value);
                    taken
                }
            }
        };
        if !waiters.is_empty() {
            rt_debug!(level::IVAR, "cell filled, unblocking {} waiters", waiters.len());
        }
        for w in waiters {
            // A dropped reader is not an error.
            let _ = w.send(());
        }
        Ok(())
    }

    /// Read the cell, suspending until it is full.
    pub async fn get(&self) -> T {
        loop {
            let rx = {
                let mut state = self.inner.lock().expect("ivar lock poisoned");
                match &mut *state {
                    State::Full(v) => return v.clone(),
                    State::Empty { waiters } => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        rx
                    }
                }
            };
            rt_debug!(level::IVAR, "task blocked on empty cell");
            // A closed channel means the writer side was dropped without a
            // put; loop and park again so the single-assignment contract is
            // decided by the cell state alone.
            let _ = rx.await;
        }
    }

    /// Non-suspending read.
    pub fn try_get(&self) -> Option<T> {
        match &*self.inner.lock().expect("ivar lock poisoned") {
            State::Full(v) => Some(v.clone()),
            State::Empty { .. } => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(
            &*self.inner.lock().expect("ivar lock poisoned"),
            State::Full(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_after_put_returns_value() {
        let iv = IVar::new();
        iv.put(7i64).unwrap();
        assert_eq!(iv.get().await, 7);
        assert_eq!(iv.try_get(), Some(7));
    }

    #[tokio::test]
    async fn second_put_is_double_put() {
        let iv = IVar::new();
        iv.put(1i64).unwrap();
        let err = iv.put(2).unwrap_err();
        assert!(matches!(err, RtError::DoublePut));
        // The first value survives.
        assert_eq!(iv.get().await, 1);
    }

    #[tokio::test]
    async fn get_blocks_until_put() {
        let iv = IVar::<i64>::new();
        let reader = {
            let iv = iv.clone();
            tokio::spawn(async move { iv.get().await })
        };
        // Give the reader a chance to park.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!iv.is_full());
        iv.put(99).unwrap();
        assert_eq!(reader.await.unwrap(), 99);
    }

    #[tokio::test]
    async fn all_readers_see_the_same_value() {
        let iv = IVar::<String>::new();
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let iv = iv.clone();
                tokio::spawn(async move { iv.get().await })
            })
            .collect();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        iv.put("once".to_string()).unwrap();
        for r in readers {
            assert_eq!(r.await.unwrap(), "once");
        }
    }
}
