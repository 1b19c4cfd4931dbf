// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Clustering combinators: evaluate groups of elements as units.
//!
//! `chunk`/`unchunk` and `slice`/`unslice` are inverse pairs; any pair of
//! functions with that property works with [`eval_cluster_by`].

use std::future::Future;

use shoal_runtime::Result;

/// Contiguous splits of size `k`: `chunk(3, [c1..c5])` is
/// `[[c1,c2,c3],[c4,c5]]`.
pub fn chunk<T>(k: usize, xs: Vec<T>) -> Vec<Vec<T>> {
    let k = k.max(1);
    let mut out = Vec::with_capacity(xs.len().div_ceil(k));
    let mut it = xs.into_iter();
    loop {
        let c: Vec<T> = it.by_ref().take(k).collect();
        if c.is_empty() {
            break;
        }
        out.push(c);
    }
    out
}

pub fn unchunk<T>(xss: Vec<Vec<T>>) -> Vec<T> {
    xss.into_iter().flatten().collect()
}

/// `k` interleaved subsequences: `slice(3, [c1..c5])` is
/// `[[c1,c4],[c2,c5],[c3]]`.
pub fn slice<T>(k: usize, xs: Vec<T>) -> Vec<Vec<T>> {
    let k = k.max(1).min(xs.len().max(1));
    let mut out: Vec<Vec<T>> = (0..k).map(|_| Vec::new()).collect();
    for (i, x) in xs.into_iter().enumerate() {
        out[i % k].push(x);
    }
    out
}

/// Round-robin merge, the inverse of [`slice`].
pub fn unslice<T>(xss: Vec<Vec<T>>) -> Vec<T> {
    let mut iters: Vec<_> = xss.into_iter().map(|v| v.into_iter()).collect();
    let mut out = Vec::new();
    loop {
        let mut any = false;
        for it in &mut iters {
            if let Some(x) = it.next() {
                out.push(x);
                any = true;
            }
        }
        if !any {
            return out;
        }
    }
}

/// Evaluate `x` through a clustered view: cluster, evaluate the clusters,
/// uncluster.  Requires `uncluster ∘ cluster = id`.
pub async fn eval_cluster_by<A, B, B2, D, C, U, S, Fut>(
    x: A,
    cluster: C,
    uncluster: U,
    strat: S,
) -> Result<D>
where
    C: FnOnce(A) -> B,
    U: FnOnce(B2) -> D,
    S: FnOnce(B) -> Fut,
    Fut: Future<Output = Result<B2>>,
{
    Ok(uncluster(strat(cluster(x)).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_matches_contract() {
        assert_eq!(
            chunk(3, vec![1, 2, 3, 4, 5]),
            vec![vec![1, 2, 3], vec![4, 5]]
        );
        assert_eq!(chunk(1, vec![1, 2]), vec![vec![1], vec![2]]);
        assert!(chunk::<i32>(3, vec![]).is_empty());
    }

    #[test]
    fn slice_matches_contract() {
        assert_eq!(
            slice(3, vec![1, 2, 3, 4, 5]),
            vec![vec![1, 4], vec![2, 5], vec![3]]
        );
        assert_eq!(slice(1, vec![1, 2, 3]), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn unchunk_inverts_chunk() {
        for k in 1..=7 {
            for n in 0..=10 {
                let xs: Vec<i32> = (0..n).collect();
                assert_eq!(unchunk(chunk(k, xs.clone())), xs, "k={k} n={n}");
            }
        }
    }

    #[test]
    fn unslice_inverts_slice() {
        for k in 1..=7 {
            for n in 0..=10 {
                let xs: Vec<i32> = (0..n).collect();
                assert_eq!(unslice(slice(k, xs.clone())), xs, "k={k} n={n}");
            }
        }
    }

    #[tokio::test]
    async fn eval_cluster_by_roundtrips_through_clusters() {
        let xs: Vec<i32> = (0..9).collect();
        let out = eval_cluster_by(
            xs.clone(),
            |v| chunk(4, v),
            unchunk,
            |chunks| async move { Ok(chunks) },
        )
        .await
        .unwrap();
        assert_eq!(out, xs);
    }
}
