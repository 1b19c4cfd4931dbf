// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Divide-and-conquer over shipped closures: naive Fibonacci.

use shoal::prelude::*;

fn trivial(n: i64) -> bool {
    n <= 1
}

fn decompose(n: i64) -> Vec<i64> {
    vec![n - 1, n - 2]
}

fn combine(arg: (i64, Vec<i64>)) -> i64 {
    let (_, subs) = arg;
    subs.iter().sum()
}

fn solve(n: i64) -> i64 {
    n
}

#[test]
fn fibonacci_ten_is_fifty_five() {
    register_builtins().unwrap();
    register_divide_and_conquer::<i64, i64>().unwrap();
    register_fn("fib::trivial", trivial as fn(i64) -> bool).unwrap();
    register_fn("fib::decompose", decompose as fn(i64) -> Vec<i64>).unwrap();
    register_fn("fib::combine", combine as fn((i64, Vec<i64>)) -> i64).unwrap();
    register_fn("fib::solve", solve as fn(i64) -> i64).unwrap();

    let out = run_par(RuntimeConfig::single_node(), |par| async move {
        let t = fn_closure("fib::trivial", trivial as fn(i64) -> bool);
        let d = fn_closure("fib::decompose", decompose as fn(i64) -> Vec<i64>);
        let c = fn_closure("fib::combine", combine as fn((i64, Vec<i64>)) -> i64);
        let s = fn_closure("fib::solve", solve as fn(i64) -> i64);

        let sparked = par_divide_and_conquer(&par, &t, &d, &c, &s, 10).await?;
        assert_eq!(sparked, 55);

        let pushed = push_divide_and_conquer(&par, &t, &d, &c, &s, 10).await?;
        assert_eq!(pushed, 55);

        Ok(sparked)
    })
    .unwrap();
    assert_eq!(out, Some(55));
}
