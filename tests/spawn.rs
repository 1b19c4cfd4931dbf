// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `spawn`/`spawn_at`: a sparked task writes its result through a
//! globalised cell and `get` observes it.

use futures::future::BoxFuture;
use shoal::prelude::*;

fn const42(_par: Par, _env: ()) -> BoxFuture<'static, Result<Closure<i64>>> {
    Box::pin(async move { Ok(to_closure(&42i64)?) })
}

fn from_env(_par: Par, base: i64) -> BoxFuture<'static, Result<Closure<i64>>> {
    Box::pin(async move { Ok(to_closure(&(base * 2))?) })
}

#[test]
fn spawn_fills_the_result_cell() {
    register_builtins().unwrap();
    register_spawnable::<i64>().unwrap();
    register_spawn_fn::<(), i64>("tests::const42", const42).unwrap();
    register_spawn_fn::<i64, i64>("tests::from_env", from_env).unwrap();

    let out = run_par(RuntimeConfig::single_node(), |par| async move {
        let cell = par.spawn(spawn_fn_closure("tests::const42", const42, &())?)?;
        let got = cell.get().await.value()?;
        assert_eq!(got, 42);

        // Eager placement at a named node (ourselves, on one node).
        let me = my_node()?;
        let cell = par
            .spawn_at(spawn_fn_closure("tests::from_env", from_env, &21i64)?, me)
            .await?;
        assert_eq!(cell.get().await.value()?, 42);

        Ok(got)
    })
    .unwrap();
    assert_eq!(out, Some(42));
}
