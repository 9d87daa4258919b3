//! Work partitioning for parallel kernels
//!
//! Matrix products are cut into a grid of `nchunk0 x nchunk1` tiles over
//! the `nr0` output units and `nr1` tokens. Worker `ith` starts on tile
//! `ith` and then claims further tiles from a shared [`ChunkCursor`], so
//! uneven tiles (e.g. where most units are inactive) balance themselves.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tile edge for general products
pub const CHUNK_SIZE: usize = 16;

/// Tile edge when either output dimension is 1
pub const CHUNK_SIZE_VECTOR: usize = 64;

/// Tiling of an `nr0 x nr1` output for `nth` workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Output units (rows of the weight matrix)
    pub nr0: usize,
    /// Tokens (rows of the activation)
    pub nr1: usize,
    /// Nominal tile edge before re-chunking
    pub chunk_size: usize,
    /// Tiles along `nr0`
    pub nchunk0: usize,
    /// Tiles along `nr1`
    pub nchunk1: usize,
    /// Units per tile
    pub dr0: usize,
    /// Tokens per tile
    pub dr1: usize,
}

impl ChunkPlan {
    /// Plan an `nr0 x nr1` output for `nth` workers.
    ///
    /// When the nominal grid has fewer than four tiles per worker, the
    /// output is split into `nth` tiles along its larger dimension instead.
    pub fn new(nr0: usize, nr1: usize, nth: usize) -> Self {
        let nth = nth.max(1);
        let chunk_size = if nr0 == 1 || nr1 == 1 {
            CHUNK_SIZE_VECTOR
        } else {
            CHUNK_SIZE
        };

        if nr0 == 0 || nr1 == 0 {
            return Self {
                nr0,
                nr1,
                chunk_size,
                nchunk0: 0,
                nchunk1: 0,
                dr0: 0,
                dr1: 0,
            };
        }

        let mut nchunk0 = nr0.div_ceil(chunk_size);
        let mut nchunk1 = nr1.div_ceil(chunk_size);

        if nchunk0 * nchunk1 < nth * 4 {
            if nr0 > nr1 {
                nchunk0 = nth;
                nchunk1 = 1;
            } else {
                nchunk0 = 1;
                nchunk1 = nth;
            }
        }

        Self {
            nr0,
            nr1,
            chunk_size,
            nchunk0,
            nchunk1,
            dr0: nr0.div_ceil(nchunk0),
            dr1: nr1.div_ceil(nchunk1),
        }
    }

    /// Total number of tiles
    pub fn num_chunks(&self) -> usize {
        self.nchunk0 * self.nchunk1
    }

    /// Unit and token ranges of tile `idx`; either may be empty
    pub fn chunk_range(&self, idx: usize) -> (Range<usize>, Range<usize>) {
        let ith0 = idx % self.nchunk0.max(1);
        let ith1 = idx / self.nchunk0.max(1);

        let ir0_start = (self.dr0 * ith0).min(self.nr0);
        let ir0_end = (self.dr0 * (ith0 + 1)).min(self.nr0);
        let ir1_start = (self.dr1 * ith1).min(self.nr1);
        let ir1_end = (self.dr1 * (ith1 + 1)).min(self.nr1);

        (ir0_start..ir0_end, ir1_start..ir1_end)
    }

    /// Tiles a worker takes under static round-robin assignment
    pub fn chunks_for(&self, ith: usize, nth: usize) -> impl Iterator<Item = usize> {
        (ith..self.num_chunks()).step_by(nth.max(1))
    }
}

/// Shared counter handing out tiles beyond each worker's first
#[derive(Debug)]
pub struct ChunkCursor {
    next: AtomicUsize,
}

impl ChunkCursor {
    /// Cursor whose first claim returns `first`; normally `nth`
    pub fn new(first: usize) -> Self {
        Self {
            next: AtomicUsize::new(first),
        }
    }

    /// Claim the next tile, if any remain
    pub fn claim(&self, total: usize) -> Option<usize> {
        let idx = self.next.fetch_add(1, Ordering::AcqRel);
        (idx < total).then_some(idx)
    }

    /// Visit tile `ith`, then every tile this worker claims
    pub fn for_each<F>(&self, ith: usize, total: usize, mut f: F)
    where
        F: FnMut(usize),
    {
        let mut idx = Some(ith).filter(|&i| i < total);
        while let Some(i) = idx {
            f(i);
            idx = self.claim(total);
        }
    }
}

/// Contiguous share of `n` items for worker `id` of `workers`.
///
/// Items are handed out in blocks of `block`; the first `nblocks % workers`
/// workers get one extra block, and the final block may be short.
pub fn distribute_items(n: usize, workers: usize, id: usize, block: usize) -> Range<usize> {
    let workers = workers.max(1);
    let block = block.max(1);
    let nblocks = n.div_ceil(block);
    let base = nblocks / workers;
    let rem = nblocks % workers;

    let start_block = id * base + id.min(rem);
    let count = base + usize::from(id < rem);

    let start = (start_block * block).min(n);
    let end = ((start_block + count) * block).min(n);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_vector_rechunk() {
        let plan = ChunkPlan::new(1000, 1, 8);
        assert_eq!(plan.chunk_size, 64);
        assert_eq!(plan.nchunk0, 8);
        assert_eq!(plan.nchunk1, 1);
        assert_eq!(plan.dr0, 125);
        assert_eq!(plan.chunk_range(7), (875..1000, 0..1));
    }

    #[test]
    fn test_matrix_plan_keeps_tiles() {
        let plan = ChunkPlan::new(1024, 64, 4);
        assert_eq!(plan.chunk_size, 16);
        assert_eq!(plan.nchunk0, 64);
        assert_eq!(plan.nchunk1, 4);
        assert_eq!(plan.chunk_range(65), (16..32, 16..32));
    }

    #[test]
    fn test_rechunk_along_tokens() {
        let plan = ChunkPlan::new(16, 40, 4);
        assert_eq!(plan.nchunk0, 1);
        assert_eq!(plan.nchunk1, 4);
        assert_eq!(plan.dr1, 10);
    }

    #[test]
    fn test_empty_plan() {
        let plan = ChunkPlan::new(0, 5, 4);
        assert_eq!(plan.num_chunks(), 0);
        assert_eq!(plan.chunks_for(0, 4).count(), 0);
    }

    #[test]
    fn test_distribute_items() {
        let got: Vec<_> = (0..5).map(|id| distribute_items(8, 5, id, 1)).collect();
        assert_eq!(got, vec![0..2, 2..4, 4..6, 6..7, 7..8]);

        let got: Vec<_> = (0..5).map(|id| distribute_items(17, 5, id, 2)).collect();
        assert_eq!(got, vec![0..4, 4..8, 8..12, 12..16, 16..17]);

        assert_eq!(distribute_items(2, 4, 3, 1), 2..2);
    }

    #[test]
    fn test_cursor_visits_every_tile_once() {
        let total = 37;
        let nth = 4;
        let cursor = ChunkCursor::new(nth);
        let seen: Vec<AtomicUsize> = (0..total).map(|_| AtomicUsize::new(0)).collect();

        std::thread::scope(|s| {
            for ith in 0..nth {
                let (cursor, seen) = (&cursor, &seen);
                s.spawn(move || {
                    cursor.for_each(ith, total, |i| {
                        seen[i].fetch_add(1, Ordering::SeqCst);
                    })
                });
            }
        });

        assert!(seen.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    proptest! {
        #[test]
        fn prop_plan_covers_output_once(nr0 in 1usize..300, nr1 in 1usize..70, nth in 1usize..12) {
            let plan = ChunkPlan::new(nr0, nr1, nth);
            let mut hits = vec![0u8; nr0 * nr1];
            for idx in 0..plan.num_chunks() {
                let (r0, r1) = plan.chunk_range(idx);
                for i1 in r1.clone() {
                    for i0 in r0.clone() {
                        hits[i1 * nr0 + i0] += 1;
                    }
                }
            }
            prop_assert!(hits.iter().all(|&h| h == 1));
        }

        #[test]
        fn prop_distribute_partitions(n in 0usize..500, workers in 1usize..16, block in 1usize..8) {
            let mut next = 0;
            for id in 0..workers {
                let r = distribute_items(n, workers, id, block);
                prop_assert_eq!(r.start, next);
                next = r.end;
            }
            prop_assert_eq!(next, n);
        }
    }
}
