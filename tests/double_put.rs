// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A second write to a single-assignment cell is the fatal `DoublePut`
//! error and fails the whole computation.

use shoal::prelude::*;

#[test]
fn double_put_aborts_the_computation() {
    let err = run_par(RuntimeConfig::single_node(), |_par| async move {
        let cell: IVar<i64> = IVar::new();
        cell.put(1)?;
        cell.put(2)?;
        Ok(())
    })
    .unwrap_err();
    assert!(matches!(err, RtError::DoublePut), "got: {err:?}");
}
