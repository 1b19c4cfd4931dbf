// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration assembly.
//!
//! A node's configuration is stacked from up to four layers, weakest
//! first: the machine (`/etc/shoal`), the user (XDG config directory),
//! the workspace (`.shoal/` or a bare `shoal.yaml`), and finally an
//! explicit file chosen by the embedding program.  Each layer contributes
//! at most one file.  Stronger layers win on scalars; mappings are
//! combined key by key so a layer can override a single field without
//! restating the rest.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde_yaml::Value;

use crate::RuntimeConfig;

/// File names accepted within a layer directory, in preference order.
const LAYER_FILES: [&str; 2] = ["config.yaml", "config.yml"];

/// Candidate directories, weakest layer first.
fn layer_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("/etc/shoal")];
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".config").join("shoal"));
    }
    if let Some(xdg) = dirs::config_dir() {
        dirs.push(xdg.join("shoal"));
    }
    dirs.push(PathBuf::from(".shoal"));
    dirs
}

/// Resolve the file stack for this invocation.  Layer directories
/// contribute their first matching file name; the workspace may instead
/// hold a bare `shoal.yaml`; the explicit path, when given, must exist.
fn file_stack(explicit: Option<&Path>) -> anyhow::Result<Vec<PathBuf>> {
    let mut stack = Vec::new();
    for dir in layer_dirs() {
        if let Some(file) = LAYER_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
        {
            stack.push(file);
        }
    }
    for bare in ["shoal.yaml", "shoal.yml"] {
        let p = PathBuf::from(bare);
        if p.is_file() {
            stack.push(p);
            break;
        }
    }
    if let Some(p) = explicit {
        if !p.is_file() {
            bail!("config file {} does not exist", p.display());
        }
        stack.push(p.to_path_buf());
    }
    Ok(stack)
}

fn parse_layer(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Combine two layers: `over` shadows `base` wherever both speak, except
/// that mappings are combined entry-wise.
fn overlay(base: Value, over: Value) -> Value {
    match (base, over) {
        (Value::Mapping(mut weak), Value::Mapping(strong)) => {
            for (key, value) in strong {
                let combined = match weak.remove(&key) {
                    Some(beneath) => overlay(beneath, value),
                    None => value,
                };
                weak.insert(key, combined);
            }
            Value::Mapping(weak)
        }
        (_, over) => over,
    }
}

/// Assemble and validate this node's configuration.  With no config files
/// anywhere, the built-in defaults apply.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    let mut stacked: Option<Value> = None;
    for path in file_stack(explicit)? {
        tracing::debug!(layer = %path.display(), "applying config layer");
        let layer = parse_layer(&path)?;
        stacked = Some(match stacked.take() {
            None => layer,
            Some(beneath) => overlay(beneath, layer),
        });
    }
    let config: RuntimeConfig = match stacked {
        None => RuntimeConfig::default(),
        Some(value) => {
            serde_yaml::from_value(value).context("interpreting stacked configuration")?
        }
    };
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn overlay_scalar_takes_the_stronger_layer() {
        let merged = overlay(yaml("debug_level: 1"), yaml("debug_level: 6"));
        assert_eq!(merged["debug_level"].as_i64(), Some(6));
    }

    #[test]
    fn overlay_keeps_fields_the_stronger_layer_is_silent_on() {
        let merged = overlay(
            yaml("num_workers: 4\nmax_fish: 1"),
            yaml("max_fish: 8\nchaos_monkey: true"),
        );
        assert_eq!(merged["num_workers"].as_i64(), Some(4));
        assert_eq!(merged["max_fish"].as_i64(), Some(8));
        assert_eq!(merged["chaos_monkey"].as_bool(), Some(true));
    }

    #[test]
    fn overlay_replaces_sequences_wholesale() {
        // Peer lists do not splice: a stronger layer restates the cluster.
        let merged = overlay(
            yaml("peers: [\"10.0.0.2:7071\", \"10.0.0.3:7071\"]"),
            yaml("peers: [\"10.0.0.9:7071\"]"),
        );
        assert_eq!(merged["peers"].as_sequence().map(|s| s.len()), Some(1));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load(Some(Path::new("/tmp/shoal_no_such_config.yaml"))).is_err());
    }

    #[test]
    fn explicit_file_shadows_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "listen: 127.0.0.1:9999").unwrap();
        writeln!(f, "main_node: true").unwrap();
        writeln!(f, "debug_level: 3").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9999");
        assert!(cfg.main_node);
        assert_eq!(cfg.debug_level, 3);
        // Everything the file is silent on keeps its default.
        assert_eq!(cfg.max_fish, RuntimeConfig::default().max_fish);
    }

    #[test]
    fn settings_failing_validation_are_rejected() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "num_workers: 0").unwrap();
        assert!(load(Some(f.path())).is_err());
    }
}
