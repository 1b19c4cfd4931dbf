// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Task-farm skeletons on a single-node cluster: result values, input
//! ordering, and agreement with the plain sequential map.

use shoal::prelude::*;

fn inc(x: i64) -> i64 {
    x + 1
}

#[test]
fn par_map_families_match_sequential_map() {
    register_builtins().unwrap();
    register_par_map::<i64, i64>().unwrap();
    register_map_lift::<i64, i64>().unwrap();
    register_fn("tests::inc", inc as fn(i64) -> i64).unwrap();

    let out = run_par(RuntimeConfig::single_node(), |par| async move {
        let f = fn_closure("tests::inc", inc as fn(i64) -> i64);
        let xs: Vec<i64> = (0..10).collect();
        let expected: Vec<i64> = (1..=10).collect();

        // Forced: results come home as plain values.
        let forced = par_map_nf(&par, &f, xs.clone()).await?;
        assert_eq!(forced, expected, "par_map_nf result order follows input order");

        // Unforced: the r0 strategy ships back unevaluated applications;
        // unpacking them locally must agree with the sequential map.
        let lazy = par_map(&par, &r0::<i64>(), &f, xs.clone()).await?;
        assert_eq!(lazy, expected);

        // Clustered variants, both cluster shapes.
        let chunked =
            par_map_chunked(&par, 3, &force_cc::<Vec<i64>>(), &f, xs.clone()).await?;
        assert_eq!(chunked, expected);
        let sliced = par_map_sliced(&par, 3, &force_cc::<Vec<i64>>(), &f, xs.clone()).await?;
        assert_eq!(sliced, expected);

        // Eager placement on a one-node cluster degenerates to local forks.
        let me = my_node()?;
        let pushed = push_map(&par, &force_cc::<i64>(), &[me], &f, xs).await?;
        assert_eq!(pushed, expected);

        Ok(())
    })
    .unwrap();
    assert!(out.is_some(), "main node returns the program result");
}
