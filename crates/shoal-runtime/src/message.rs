// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire protocol between nodes.
//!
//! Every envelope on a link is a 4-byte big-endian length prefix (written by
//! the comm layer), then a 1-byte tag, then a tag-specific payload:
//!
//! | tag | payload |
//! |-----|---------|
//! | FISH      | fisher node |
//! | SCHEDULE  | fisher node, stolen spark closure |
//! | NOWORK    | fisher node |
//! | EXECUTE   | task closure |
//! | RPUT      | slot (8 bytes BE), value closure |
//! | QUIESCE   | CBOR probe counters |
//! | SHUTDOWN  | — |
//! | HEARTBEAT | sequence (8 bytes BE) |
//!
//! Closures travel as `(2-byte label length, label, payload)` — see
//! [`WireForm::to_bytes`].  Node identities travel as length-prefixed
//! address strings.  HELLO and NODELIST are startup-only control frames:
//! HELLO identifies a freshly dialed link, NODELIST is the canonical node
//! ordering published by the main node before the runtime begins.

use serde::{Deserialize, Serialize};

use shoal_closure::WireForm;

use crate::error::{Result, RtError};
use crate::location::NodeId;

pub(crate) const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

const TAG_FISH: u8 = 1;
const TAG_SCHEDULE: u8 = 2;
const TAG_NOWORK: u8 = 3;
const TAG_EXECUTE: u8 = 4;
const TAG_RPUT: u8 = 5;
const TAG_QUIESCE: u8 = 6;
const TAG_SHUTDOWN: u8 = 7;
const TAG_HEARTBEAT: u8 = 8;
const TAG_HELLO: u8 = 100;
const TAG_NODELIST: u8 = 101;

/// Counters carried by the termination probe as it circles the node ring.
/// `sent`/`received` cover only work-bearing messages (SCHEDULE, EXECUTE,
/// RPUT); fishing chatter and heartbeats never quiesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiesceProbe {
    pub hops: u32,
    pub sent: u64,
    pub received: u64,
    pub active: u64,
}

#[derive(Debug, Clone)]
pub enum Msg {
    /// Work-stealing request from an idle node.
    Fish { fisher: NodeId },
    /// A stolen spark on its way to the fisher.
    Schedule { fisher: NodeId, spark: WireForm },
    /// The victim had nothing to give.
    NoWork { fisher: NodeId },
    /// Eager placement: fork this task here.
    Execute { task: WireForm },
    /// Resolve a globalised cell.
    RPut { slot: u64, value: WireForm },
    /// Termination probe.
    Quiesce { probe: QuiesceProbe },
    /// Orderly exit.
    Shutdown,
    /// Liveness probe.
    Heartbeat { seq: u64 },
    /// Startup: link identification.
    Hello { from: NodeId },
    /// Startup: canonical node ordering, main node first.
    NodeList { nodes: Vec<NodeId> },
}

impl Msg {
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Fish { .. } => "FISH",
            Msg::Schedule { .. } => "SCHEDULE",
            Msg::NoWork { .. } => "NOWORK",
            Msg::Execute { .. } => "EXECUTE",
            Msg::RPut { .. } => "RPUT",
            Msg::Quiesce { .. } => "QUIESCE",
            Msg::Shutdown => "SHUTDOWN",
            Msg::Heartbeat { .. } => "HEARTBEAT",
            Msg::Hello { .. } => "HELLO",
            Msg::NodeList { .. } => "NODELIST",
        }
    }

    /// Whether this message carries work and therefore participates in the
    /// quiescence send/receive accounting.
    pub(crate) fn bears_work(&self) -> bool {
        matches!(
            self,
            Msg::Schedule { .. } | Msg::Execute { .. } | Msg::RPut { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Msg::Fish { fisher } => {
                out.push(TAG_FISH);
                put_node(&mut out, fisher);
            }
            Msg::Schedule { fisher, spark } => {
                out.push(TAG_SCHEDULE);
                put_node(&mut out, fisher);
                out.extend_from_slice(&spark.to_bytes()?);
            }
            Msg::NoWork { fisher } => {
                out.push(TAG_NOWORK);
                put_node(&mut out, fisher);
            }
            Msg::Execute { task } => {
                out.push(TAG_EXECUTE);
                out.extend_from_slice(&task.to_bytes()?);
            }
            Msg::RPut { slot, value } => {
                out.push(TAG_RPUT);
                out.extend_from_slice(&slot.to_be_bytes());
                out.extend_from_slice(&value.to_bytes()?);
            }
            Msg::Quiesce { probe } => {
                out.push(TAG_QUIESCE);
                out.extend_from_slice(&cbor(probe)?);
            }
            Msg::Shutdown => out.push(TAG_SHUTDOWN),
            Msg::Heartbeat { seq } => {
                out.push(TAG_HEARTBEAT);
                out.extend_from_slice(&seq.to_be_bytes());
            }
            Msg::Hello { from } => {
                out.push(TAG_HELLO);
                put_node(&mut out, from);
            }
            Msg::NodeList { nodes } => {
                out.push(TAG_NODELIST);
                out.extend_from_slice(&cbor(nodes)?);
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Msg> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| RtError::WireDecode("empty envelope".to_string()))?;
        match tag {
            TAG_FISH => {
                let (fisher, rest) = take_node(rest)?;
                expect_drained("FISH", rest)?;
                Ok(Msg::Fish { fisher })
            }
            TAG_SCHEDULE => {
                let (fisher, rest) = take_node(rest)?;
                let spark = WireForm::from_bytes(rest)
                    .map_err(|e| RtError::WireDecode(format!("SCHEDULE closure: {e}")))?;
                Ok(Msg::Schedule { fisher, spark })
            }
            TAG_NOWORK => {
                let (fisher, rest) = take_node(rest)?;
                expect_drained("NOWORK", rest)?;
                Ok(Msg::NoWork { fisher })
            }
            TAG_EXECUTE => {
                let task = WireForm::from_bytes(rest)
                    .map_err(|e| RtError::WireDecode(format!("EXECUTE closure: {e}")))?;
                Ok(Msg::Execute { task })
            }
            TAG_RPUT => {
                if rest.len() < 8 {
                    return Err(RtError::WireDecode("truncated RPUT slot".to_string()));
                }
                let slot = u64::from_be_bytes(rest[..8].try_into().expect("8-byte slice"));
                let value = WireForm::from_bytes(&rest[8..])
                    .map_err(|e| RtError::WireDecode(format!("RPUT closure: {e}")))?;
                Ok(Msg::RPut { slot, value })
            }
            TAG_QUIESCE => Ok(Msg::Quiesce {
                probe: uncbor(rest, "QUIESCE")?,
            }),
            TAG_SHUTDOWN => {
                expect_drained("SHUTDOWN", rest)?;
                Ok(Msg::Shutdown)
            }
            TAG_HEARTBEAT => {
                if rest.len() != 8 {
                    return Err(RtError::WireDecode("bad HEARTBEAT length".to_string()));
                }
                let seq = u64::from_be_bytes(rest.try_into().expect("8-byte slice"));
                Ok(Msg::Heartbeat { seq })
            }
            TAG_HELLO => {
                let (from, rest) = take_node(rest)?;
                expect_drained("HELLO", rest)?;
                Ok(Msg::Hello { from })
            }
            TAG_NODELIST => Ok(Msg::NodeList {
                nodes: uncbor(rest, "NODELIST")?,
            }),
            other => Err(RtError::WireDecode(format!("unknown tag {other}"))),
        }
    }
}

// ── Encoding helpers ──────────────────────────────────────────────────────────

fn put_node(out: &mut Vec<u8>, node: &NodeId) {
    let s = node.to_string();
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_node(buf: &[u8]) -> Result<(NodeId, &[u8])> {
    if buf.len() < 2 {
        return Err(RtError::WireDecode("truncated node id".to_string()));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return Err(RtError::WireDecode("truncated node id".to_string()));
    }
    let s = std::str::from_utf8(&buf[2..2 + len])
        .map_err(|e| RtError::WireDecode(format!("node id is not UTF-8: {e}")))?;
    let node = s
        .parse::<NodeId>()
        .map_err(|_| RtError::WireDecode(format!("bad node address {s:?}")))?;
    Ok((node, &buf[2 + len..]))
}

fn expect_drained(kind: &str, rest: &[u8]) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(RtError::WireDecode(format!(
            "{kind} envelope has {} trailing bytes",
            rest.len()
        )))
    }
}

fn cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    shoal_closure::codec::encode(value).map_err(|e| RtError::WireDecode(e.to_string()))
}

fn uncbor<T: serde::de::DeserializeOwned>(bytes: &[u8], kind: &str) -> Result<T> {
    shoal_closure::codec::decode(bytes).map_err(|e| RtError::WireDecode(format!("{kind}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn roundtrip(msg: Msg) -> Msg {
        Msg::decode(&msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn fish_roundtrip() {
        let m = roundtrip(Msg::Fish {
            fisher: node("10.0.0.7:7071"),
        });
        match m {
            Msg::Fish { fisher } => assert_eq!(fisher, node("10.0.0.7:7071")),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn schedule_carries_spark_and_fisher() {
        let spark = WireForm {
            label: "job::crunch".to_string(),
            payload: vec![1, 2, 3, 4],
        };
        let m = roundtrip(Msg::Schedule {
            fisher: node("127.0.0.1:9001"),
            spark: spark.clone(),
        });
        match m {
            Msg::Schedule { fisher, spark: s } => {
                assert_eq!(fisher, node("127.0.0.1:9001"));
                assert_eq!(s, spark);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rput_slot_is_big_endian() {
        let m = Msg::RPut {
            slot: 0x0102030405060708,
            value: WireForm {
                label: "v".to_string(),
                payload: vec![],
            },
        };
        let bytes = m.encode().unwrap();
        assert_eq!(bytes[0], TAG_RPUT);
        assert_eq!(&bytes[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(roundtrip(m), Msg::RPut { slot, .. } if slot == 0x0102030405060708));
    }

    #[test]
    fn quiesce_probe_roundtrip() {
        let probe = QuiesceProbe {
            hops: 3,
            sent: 10,
            received: 9,
            active: 1,
        };
        match roundtrip(Msg::Quiesce { probe }) {
            Msg::Quiesce { probe: p } => assert_eq!(p, probe),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn shutdown_is_a_bare_tag() {
        assert_eq!(Msg::Shutdown.encode().unwrap(), vec![TAG_SHUTDOWN]);
        assert!(matches!(roundtrip(Msg::Shutdown), Msg::Shutdown));
    }

    #[test]
    fn nodelist_keeps_ordering() {
        let nodes = vec![node("10.0.0.1:1"), node("10.0.0.3:3"), node("10.0.0.2:2")];
        match roundtrip(Msg::NodeList {
            nodes: nodes.clone(),
        }) {
            Msg::NodeList { nodes: n } => assert_eq!(n, nodes),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn truncated_envelope_is_wire_decode() {
        let bytes = Msg::Fish {
            fisher: node("127.0.0.1:1"),
        }
        .encode()
        .unwrap();
        let err = Msg::decode(&bytes[..2]).unwrap_err();
        assert!(matches!(err, RtError::WireDecode(_)));
        assert!(matches!(Msg::decode(&[]).unwrap_err(), RtError::WireDecode(_)));
        assert!(matches!(Msg::decode(&[250]).unwrap_err(), RtError::WireDecode(_)));
    }

    #[test]
    fn only_work_messages_count_for_quiescence() {
        let w = WireForm {
            label: "x".to_string(),
            payload: vec![],
        };
        assert!(Msg::Execute { task: w.clone() }.bears_work());
        assert!(Msg::RPut { slot: 0, value: w.clone() }.bears_work());
        assert!(Msg::Schedule { fisher: node("127.0.0.1:1"), spark: w }.bears_work());
        assert!(!Msg::Fish { fisher: node("127.0.0.1:1") }.bears_work());
        assert!(!Msg::Heartbeat { seq: 1 }.bears_work());
        assert!(!Msg::Shutdown.bears_work());
    }
}
