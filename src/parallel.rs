//! Deterministic data-parallel helpers
//!
//! Work over foreground samples is split into fixed-size chunks whose
//! boundaries do not depend on the number of threads. Partial results are
//! collected in chunk order and folded sequentially, so floating-point sums
//! are bit-identical between runs and between thread counts.

use std::ops::Range;

use rayon::prelude::*;

use crate::error::Result;

/// Samples per work chunk
pub const CHUNK_SIZE: usize = 2048;

/// Build the fixed-size worker pool of a run
pub fn build_pool(num_threads: usize) -> Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("abc-worker-{}", i))
        .build()?)
}

fn chunk_ranges(len: usize) -> Vec<Range<usize>> {
    (0..len.div_ceil(CHUNK_SIZE))
        .map(|c| c * CHUNK_SIZE..((c + 1) * CHUNK_SIZE).min(len))
        .collect()
}

/// Map every chunk of `0..len` to a partial result and fold them in order
///
/// Returns `identity` when `len` is zero.
pub fn map_reduce<A, M, F>(len: usize, identity: A, map: M, fold: F) -> A
where
    A: Send,
    M: Fn(Range<usize>) -> A + Sync + Send,
    F: Fn(A, A) -> A,
{
    let partials: Vec<A> = chunk_ranges(len).into_par_iter().map(map).collect();
    partials.into_iter().fold(identity, fold)
}

/// Run `f` on matching chunks of `out` (`stride` values per sample)
///
/// `f` receives the sample range and the output slice for that range and
/// returns a partial result; partials are folded in chunk order.
pub fn for_each_chunk_mut<T, A, M, F>(out: &mut [T], stride: usize, identity: A, map: M, fold: F) -> A
where
    T: Send,
    A: Send,
    M: Fn(Range<usize>, &mut [T]) -> A + Sync,
    F: Fn(A, A) -> A,
{
    let len = if stride == 0 { 0 } else { out.len() / stride };
    let partials: Vec<A> = out
        .par_chunks_mut(CHUNK_SIZE * stride.max(1))
        .enumerate()
        .map(|(c, chunk)| {
            let start = c * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(len);
            map(start..end, chunk)
        })
        .collect();
    partials.into_iter().fold(identity, fold)
}

/// Element-wise sum of two equally sized accumulators
pub fn add_assign(mut a: Vec<f64>, b: Vec<f64>) -> Vec<f64> {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges_cover_everything() {
        let ranges = chunk_ranges(CHUNK_SIZE * 2 + 5);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], 0..CHUNK_SIZE);
        assert_eq!(ranges[2], 2 * CHUNK_SIZE..2 * CHUNK_SIZE + 5);
        assert!(chunk_ranges(0).is_empty());
    }

    #[test]
    fn test_map_reduce_sum() {
        let n = 10_000;
        let total = map_reduce(n, 0usize, |r| r.len(), |a, b| a + b);
        assert_eq!(total, n);
    }

    #[test]
    fn test_sum_identical_across_thread_counts() {
        let values: Vec<f64> = (0..50_000).map(|i| ((i as f64) * 0.37).sin() * 1e3).collect();
        let sum_with = |threads: usize| {
            build_pool(threads).unwrap().install(|| {
                map_reduce(values.len(), 0.0, |r| values[r].iter().sum::<f64>(), |a, b| a + b)
            })
        };
        let s1 = sum_with(1);
        let s4 = sum_with(4);
        assert_eq!(s1.to_bits(), s4.to_bits(), "reduction must not depend on thread count");
    }

    #[test]
    fn test_for_each_chunk_mut_writes_all() {
        let stride = 3;
        let n = CHUNK_SIZE + 17;
        let mut out = vec![0.0; n * stride];
        let count = for_each_chunk_mut(&mut out, stride, 0usize, |range, chunk| {
            for (local, s) in range.clone().enumerate() {
                for c in 0..stride {
                    chunk[local * stride + c] = (s * stride + c) as f64;
                }
            }
            range.len()
        }, |a, b| a + b);
        assert_eq!(count, n);
        for (i, &v) in out.iter().enumerate() {
            assert_eq!(v, i as f64);
        }
    }
}
