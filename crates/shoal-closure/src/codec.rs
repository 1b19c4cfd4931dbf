// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! CBOR codec for closure payloads and structured message payloads.

use serde::{de::DeserializeOwned, Serialize};

use crate::ClosureError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClosureError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ClosureError::Codec(e.to_string()))?;
    Ok(buf)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ClosureError> {
    ciborium::from_reader(data).map_err(|e| ClosureError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_tuple() {
        let v = (42i64, "spark".to_string(), vec![1u8, 2, 3]);
        let bytes = encode(&v).unwrap();
        let back: (i64, String, Vec<u8>) = decode(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let bytes = encode(&(1i64, 2i64)).unwrap();
        let r: Result<(i64, i64), _> = decode(&bytes[..bytes.len() - 1]);
        assert!(r.is_err());
    }
}
