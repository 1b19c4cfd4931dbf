// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Node-lifetime counters.  `work_sent`/`work_received` cover only
/// work-bearing messages and feed the quiescence probe; the rest are
/// reporting.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub sparks_created: AtomicU64,
    pub sparks_converted: AtomicU64,
    pub tasks_forked: AtomicU64,
    pub msgs_sent: AtomicU64,
    pub msgs_received: AtomicU64,
    pub work_sent: AtomicU64,
    pub work_received: AtomicU64,
    pub fishes_sent: AtomicU64,
    pub nowork_received: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "sparks_created": self.sparks_created.load(Ordering::Relaxed),
            "sparks_converted": self.sparks_converted.load(Ordering::Relaxed),
            "tasks_forked": self.tasks_forked.load(Ordering::Relaxed),
            "msgs_sent": self.msgs_sent.load(Ordering::Relaxed),
            "msgs_received": self.msgs_received.load(Ordering::Relaxed),
            "fishes_sent": self.fishes_sent.load(Ordering::Relaxed),
            "nowork_received": self.nowork_received.load(Ordering::Relaxed),
        })
    }
}
