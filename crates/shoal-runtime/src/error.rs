// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use shoal_closure::ClosureError;

/// Fatal runtime error kinds.  Absent a fault-tolerance layer, any of these
/// inside a task terminates the whole computation, tagged with the emitting
/// node.
#[derive(Debug, Error)]
pub enum RtError {
    #[error("node identity read before communication init")]
    NodeIdUnset,

    #[error("double put on single-assignment cell")]
    DoublePut,

    #[error("malformed envelope: {0}")]
    WireDecode(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("quiescence reached with {0} globalised cells still empty")]
    TerminationViolation(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("closure error: {0}")]
    Closure(#[from] ClosureError),

    #[error("io error: {0}")]
    Io(String),

    #[error("runtime internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RtError {
    fn from(e: std::io::Error) -> Self {
        RtError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RtError>;
