// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ClosureError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown closure label: {0}")]
    RegistryMiss(String),

    #[error("label {0} decoded to an unexpected type")]
    TypeMismatch(String),

    #[error("duplicate registry label: {0}")]
    DuplicateLabel(String),

    #[error("registry already sealed; cannot register {0}")]
    Sealed(String),

    #[error("malformed closure wire form: {0}")]
    Wire(String),
}
