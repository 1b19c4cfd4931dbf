// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Node identity and tagged diagnostics.
//!
//! `MY_NODE` and `ALL_NODES` are process singletons populated exactly once
//! by communication init; `all_nodes()` is published by the main node in a
//! well-known ordering (main first, peers sorted) so every node agrees on
//! it.  Reading either before init is the `NodeIdUnset` error kind;
//! [`try_my_node`] returns the explicit absent variant instead.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RtError};

/// Opaque identity of one node in the cluster: the address its peers dial.
/// Totally ordered, hashable, and shippable inside message payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(SocketAddr);

impl NodeId {
    pub fn new(addr: SocketAddr) -> Self {
        NodeId(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = RtError;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|e| RtError::Config(format!("bad node address {s:?}: {e}")))?;
        Ok(NodeId(addr))
    }
}

// ── Process singletons ────────────────────────────────────────────────────────

static MY_NODE: OnceLock<NodeId> = OnceLock::new();
static ALL_NODES: OnceLock<Vec<NodeId>> = OnceLock::new();
static DEBUG_LEVEL: AtomicU8 = AtomicU8::new(0);

/// This node's identity.  Errors before communication init.
pub fn my_node() -> Result<NodeId> {
    MY_NODE.get().copied().ok_or(RtError::NodeIdUnset)
}

/// This node's identity, or `None` before communication init.
pub fn try_my_node() -> Option<NodeId> {
    MY_NODE.get().copied()
}

/// All nodes in the cluster, main node first.  Identical on every node.
pub fn all_nodes() -> Result<&'static [NodeId]> {
    ALL_NODES
        .get()
        .map(|v| v.as_slice())
        .ok_or(RtError::NodeIdUnset)
}

/// The designated main node: head of the node list.
pub fn main_node() -> Result<NodeId> {
    Ok(all_nodes()?[0])
}

pub fn is_main() -> Result<bool> {
    Ok(my_node()? == main_node()?)
}

/// Every node except this one.
pub fn peers() -> Result<Vec<NodeId>> {
    let me = my_node()?;
    Ok(all_nodes()?.iter().copied().filter(|n| *n != me).collect())
}

pub(crate) fn set_my_node(node: NodeId) -> Result<()> {
    match MY_NODE.set(node) {
        Ok(()) => Ok(()),
        // One node per process; a second runtime in the same process must
        // agree with the first identity.
        Err(_) if my_node()? == node => Ok(()),
        Err(_) => Err(RtError::Internal(format!(
            "node identity already fixed to {}, cannot become {node}",
            my_node()?
        ))),
    }
}

pub(crate) fn set_all_nodes(nodes: Vec<NodeId>) -> Result<()> {
    match ALL_NODES.set(nodes.clone()) {
        Ok(()) => Ok(()),
        Err(_) if all_nodes()? == nodes.as_slice() => Ok(()),
        Err(_) => Err(RtError::Internal(
            "node list already fixed with different contents".to_string(),
        )),
    }
}

// ── Debug levels ──────────────────────────────────────────────────────────────

/// Emission levels for runtime diagnostics.  A node configured at level `n`
/// emits every line at levels `1..=n`; all lines go to stderr via the
/// tracing subscriber, tagged with the emitting node.
pub mod level {
    /// Final stats report.
    pub const STATS: u8 = 1;
    /// Static table dump on the main node.
    pub const STATIC_TABLE: u8 = 2;
    /// Spark creation and conversion.
    pub const SPARK: u8 = 3;
    /// Outbound messages.
    pub const MSG_SEND: u8 = 4;
    /// Inbound messages.
    pub const MSG_RECV: u8 = 5;
    /// Globalised cell operations.
    pub const GIVAR: u8 = 6;
    /// Cell block/unblock events.
    pub const IVAR: u8 = 7;
    /// Static registry updates.
    pub const REGISTRY: u8 = 8;
    /// Node failure events.
    pub const FAILURE: u8 = 9;
}

pub fn debug_level() -> u8 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

pub fn set_debug_level(level: u8) {
    DEBUG_LEVEL.store(level.min(9), Ordering::Relaxed);
}

/// Emission backend for [`rt_debug!`]; prefer the macro, which skips
/// formatting entirely below the configured level.
pub fn emit(lvl: u8, args: fmt::Arguments<'_>) {
    let node = match try_my_node() {
        Some(n) => n.to_string(),
        None => "<unset>".to_string(),
    };
    tracing::debug!(target: "shoal", node = %node, level = lvl, "{args}");
}

/// Emit a diagnostic line at the given debug level, tagged with this node.
#[macro_export]
macro_rules! rt_debug {
    ($lvl:expr, $($arg:tt)*) => {
        if $crate::location::debug_level() >= $lvl {
            $crate::location::emit($lvl, format_args!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_orders_by_address() {
        let a: NodeId = "10.0.0.1:7071".parse().unwrap();
        let b: NodeId = "10.0.0.2:7071".parse().unwrap();
        assert!(a < b);
        assert_eq!(a, "10.0.0.1:7071".parse().unwrap());
    }

    #[test]
    fn node_id_display_roundtrips() {
        let a: NodeId = "127.0.0.1:9000".parse().unwrap();
        let again: NodeId = a.to_string().parse().unwrap();
        assert_eq!(a, again);
    }

    #[test]
    fn bad_address_is_config_error() {
        let err = "not-an-address".parse::<NodeId>().unwrap_err();
        assert!(matches!(err, RtError::Config(_)));
    }

    #[test]
    fn debug_level_is_clamped() {
        set_debug_level(42);
        assert_eq!(debug_level(), 9);
        set_debug_level(0);
    }
}
