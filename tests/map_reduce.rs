// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Threshold map-reduce over an inclusive range: sums, fold ordering, and
//! edge cases around the threshold.

use futures::future::BoxFuture;
use shoal::prelude::*;

fn leaf(_par: Par, n: i64) -> BoxFuture<'static, Result<i64>> {
    Box::pin(async move { Ok(n) })
}

fn add(_par: Par, args: (i64, i64)) -> BoxFuture<'static, Result<i64>> {
    Box::pin(async move { Ok(args.0 + args.1) })
}

fn digit(_par: Par, n: i64) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move { Ok(n.to_string()) })
}

fn concat(_par: Par, args: (String, String)) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move { Ok(format!("{}{}", args.0, args.1)) })
}

#[test]
fn map_reduce_matches_sequential_fold() {
    register_builtins().unwrap();
    register_map_reduce::<i64>().unwrap();
    register_map_reduce::<String>().unwrap();
    register_par_fn("mr::leaf", leaf).unwrap();
    register_par_fn("mr::add", add).unwrap();
    register_par_fn("mr::digit", digit).unwrap();
    register_par_fn("mr::concat", concat).unwrap();

    let out = run_par(RuntimeConfig::single_node(), |par| async move {
        let f = par_fn_closure("mr::leaf", leaf);
        let plus = par_fn_closure("mr::add", add);

        // Gauss: 1 + 2 + … + 1000.
        let sum = map_reduce_range_thresh(
            &par,
            50,
            InclusiveRange { lo: 1, hi: 1000 },
            &f,
            &plus,
            0,
            Placement::Spark,
        )
        .await?;
        assert_eq!(sum, 500_500);

        // Associative but non-commutative combine observes the fold order:
        // init first, then f(lo) … f(hi) left to right.
        let d = par_fn_closure("mr::digit", digit);
        let cat = par_fn_closure("mr::concat", concat);
        let text = map_reduce_range_thresh(
            &par,
            2,
            InclusiveRange { lo: 1, hi: 9 },
            &d,
            &cat,
            "0".to_string(),
            Placement::Spark,
        )
        .await?;
        assert_eq!(text, "0123456789");

        // Threshold larger than the range: pure sequential fold.
        let seq = map_reduce_range_thresh(
            &par,
            10_000,
            InclusiveRange { lo: 1, hi: 100 },
            &f,
            &plus,
            0,
            Placement::Spark,
        )
        .await?;
        assert_eq!(seq, 5_050);

        // Empty range yields init untouched.
        let empty = map_reduce_range_thresh(
            &par,
            4,
            InclusiveRange { lo: 5, hi: 4 },
            &f,
            &plus,
            7,
            Placement::Spark,
        )
        .await?;
        assert_eq!(empty, 7);

        // Eager placement (random node — ourselves here).
        let pushed = map_reduce_range_thresh(
            &par,
            10,
            InclusiveRange { lo: 1, hi: 200 },
            &f,
            &plus,
            0,
            Placement::PushRand,
        )
        .await?;
        assert_eq!(pushed, 20_100);

        Ok(sum)
    })
    .unwrap();
    assert_eq!(out, Some(500_500));
}
