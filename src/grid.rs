//! Block grid arithmetic and index newtypes.
//!
//! A vector of logical length `n` is partitioned into `⌈n/B⌉` row blocks of
//! size `B`; a matrix of shape `m×n` into `⌈m/B⌉×⌈n/B⌉` blocks. The block
//! size `B` is chosen once per library instance; every tensor in that
//! instance shares it. The final block in a dimension is short when the
//! dimension is not a multiple of `B`: its logical size is `n − (k−1)·B`,
//! never `B`.
//!
//! These helpers centralize the indexing arithmetic so off-by-one risk does
//! not spread across the storage, processor, and algorithm layers.

use crate::error::{Error, Result};

/// Entry index inside a tensor (global row or column).
pub type Index = u32;

/// Index of a row block `i ∈ {0..⌈n/B⌉-1}`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIdx(pub usize);

impl BlockIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Coordinate of a matrix block on the 2-D grid: `(row block, col block)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockCoord {
    pub row: usize,
    pub col: usize,
}

impl BlockCoord {
    #[inline]
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// The mirrored coordinate `(col, row)`; the transpose processor reads
    /// source block `(j, i)` when the destination is `(i, j)`.
    #[inline]
    pub fn transposed(self) -> Self {
        Self {
            row: self.col,
            col: self.row,
        }
    }
}

/// Number of blocks covering `dim` entries with block size `block_size`.
#[inline]
pub fn block_count(dim: usize, block_size: usize) -> Result<usize> {
    if block_size == 0 {
        return Err(Error::invalid_argument("block size must be positive"));
    }
    Ok((dim + block_size - 1) / block_size)
}

/// Logical size of block `idx` on a dimension of `dim` entries.
///
/// Every block has size `block_size` except the last, which holds the
/// remainder `dim − (k−1)·block_size`.
#[inline]
pub fn block_dim(idx: usize, dim: usize, block_size: usize) -> Result<usize> {
    let count = block_count(dim, block_size)?;
    if idx >= count {
        return Err(Error::invalid_argument(format!(
            "block index {idx} out of range (blocks={count})"
        )));
    }
    let start = idx * block_size;
    Ok((dim - start).min(block_size))
}

/// Half-open global bounds `[start, end)` of block `idx`.
#[inline]
pub fn block_bounds(idx: usize, dim: usize, block_size: usize) -> Result<(usize, usize)> {
    let size = block_dim(idx, dim, block_size)?;
    let start = idx * block_size;
    Ok((start, start + size))
}

/// Row block holding global entry `row`.
#[inline]
pub fn block_of(row: usize, block_size: usize) -> usize {
    debug_assert!(block_size > 0);
    row / block_size
}

/// Iterate `(BlockIdx, start, end)` over the 1-D grid of `dim` entries.
pub fn blocks(dim: usize, block_size: usize) -> Result<impl Iterator<Item = (BlockIdx, usize, usize)>> {
    let count = block_count(dim, block_size)?;
    Ok((0..count).map(move |i| {
        let start = i * block_size;
        let end = ((i + 1) * block_size).min(dim);
        (BlockIdx(i), start, end)
    }))
}

/// Iterate all block coordinates of the 2-D grid row-major.
pub fn coords(
    nrows: usize,
    ncols: usize,
    block_size: usize,
) -> Result<impl Iterator<Item = BlockCoord>> {
    let row_blocks = block_count(nrows, block_size)?;
    let col_blocks = block_count(ncols, block_size)?;
    Ok((0..row_blocks).flat_map(move |i| (0..col_blocks).map(move |j| BlockCoord::new(i, j))))
}
