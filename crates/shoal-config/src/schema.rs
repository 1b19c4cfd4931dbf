// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helpers.  `#[serde(default)]` on a numeric field always
/// falls back to the type's zero value, so named functions are required for
/// non-zero defaults.
fn default_listen() -> String {
    "127.0.0.1:7071".to_string()
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_max_fish() -> usize {
    2
}

fn default_fish_delay_min_ms() -> u64 {
    5
}

fn default_fish_delay_max_ms() -> u64 {
    50
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_heartbeat_misses() -> u32 {
    4
}

/// Per-node runtime configuration.
///
/// Every node in a cluster loads one of these before the runtime starts.
/// The node set is fixed at startup: `peers` must list the listen addresses
/// of every *other* node, and exactly one node sets `main_node: true`.
///
/// ```yaml
/// listen: 10.0.0.1:7071
/// main_node: true
/// peers:
///   - 10.0.0.2:7071
///   - 10.0.0.3:7071
/// num_workers: 8
/// debug_level: 3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// TCP address this node binds.  Port 0 lets the OS pick one, which is
    /// only useful for single-node runs — peers dial the configured address,
    /// so clusters need concrete ports.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address this node is reachable at from its peers, when it differs
    /// from `listen` (NAT, 0.0.0.0 binds).  Defaults to the bound address.
    #[serde(default)]
    pub public_addr: Option<String>,

    /// Listen addresses of all other nodes in the cluster.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Whether this node is the main node.  The main node runs the user
    /// program, publishes the canonical node list, and drives termination.
    #[serde(default)]
    pub main_node: bool,

    /// Worker count: OS threads for the scheduler and spark runners draining
    /// the local spark pool.  Defaults to the hardware parallelism.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Diagnostic verbosity, 0 (silent) to 9.  See the runtime's debug-level
    /// table; lines go to stderr tagged with this node's identifier.
    #[serde(default)]
    pub debug_level: u8,

    /// Maximum work-stealing requests this node keeps in flight at once.
    #[serde(default = "default_max_fish")]
    pub max_fish: usize,

    /// Bounds of the uniformly random delay a worker sleeps after a fish
    /// comes back empty (NOWORK), before fishing again.
    #[serde(default = "default_fish_delay_min_ms")]
    pub fish_delay_min_ms: u64,
    #[serde(default = "default_fish_delay_max_ms")]
    pub fish_delay_max_ms: u64,

    /// Liveness probe period.  Every node sends HEARTBEAT to every peer on
    /// this interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A peer silent for this many heartbeat intervals is declared failed.
    #[serde(default = "default_heartbeat_misses")]
    pub heartbeat_misses: u32,

    /// Fault injection for exercising the failure path: when set, this node
    /// aborts itself at a random point within the first 30 seconds.
    #[serde(default)]
    pub chaos_monkey: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_addr: None,
            peers: Vec::new(),
            main_node: false,
            num_workers: default_num_workers(),
            debug_level: 0,
            max_fish: default_max_fish(),
            fish_delay_min_ms: default_fish_delay_min_ms(),
            fish_delay_max_ms: default_fish_delay_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_misses: default_heartbeat_misses(),
            chaos_monkey: false,
        }
    }
}

impl RuntimeConfig {
    /// A one-node cluster on an OS-assigned loopback port.  The node is its
    /// own main node and has nobody to fish from; useful for tests and for
    /// running programs written against the runtime on a single machine.
    pub fn single_node() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            main_node: true,
            ..Self::default()
        }
    }

    /// Sanity checks that would otherwise surface as confusing runtime
    /// behaviour.  Called once at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_workers == 0 {
            return Err("num_workers must be at least 1".to_string());
        }
        if self.debug_level > 9 {
            return Err(format!("debug_level {} out of range 0..=9", self.debug_level));
        }
        if self.fish_delay_min_ms > self.fish_delay_max_ms {
            return Err(format!(
                "fish_delay_min_ms {} exceeds fish_delay_max_ms {}",
                self.fish_delay_min_ms, self.fish_delay_max_ms
            ));
        }
        if self.max_fish == 0 {
            return Err("max_fish must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
        assert!(RuntimeConfig::single_node().validate().is_ok());
    }

    #[test]
    fn single_node_is_main() {
        let cfg = RuntimeConfig::single_node();
        assert!(cfg.main_node);
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = RuntimeConfig {
            num_workers: 0,
            ..RuntimeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_fish_delays() {
        let cfg = RuntimeConfig {
            fish_delay_min_ms: 100,
            fish_delay_max_ms: 10,
            ..RuntimeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_roundtrip_keeps_peers() {
        let text = "listen: 10.0.0.1:7071\nmain_node: true\npeers:\n  - 10.0.0.2:7071\n";
        let cfg: RuntimeConfig = serde_yaml::from_str(text).unwrap();
        assert!(cfg.main_node);
        assert_eq!(cfg.peers, vec!["10.0.0.2:7071".to_string()]);
        assert_eq!(cfg.max_fish, 2);
    }
}
