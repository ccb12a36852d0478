//! Tensor blocks: the per-format storage tiles.
//!
//! A block owns the entries of one block-grid cell. Indices are stored
//! block-relative (always less than the block's height/width); the format
//! tag accurately describes the companion arrays, and a slot with no
//! entries is represented as *absent* at the storage level, never as an
//! empty block. Blocks are immutable once built and shared via `Arc`;
//! operations produce new blocks and swap them into the storage.
//!
//! Vector formats: coordinate and dense. Matrix formats: coordinate,
//! compressed row, and list-of-lists.

use crate::grid::Index;
use crate::types::Value;

/// Physical layout of a vector block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VectorFormat {
    Coo,
    Dense,
}

/// Physical layout of a matrix block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatrixFormat {
    Coo,
    Csr,
    Lil,
}

/// Sparse coordinate vector block: sorted row indices plus values.
///
/// `values` is empty when the element type carries no values (`void`).
#[derive(Clone, Debug)]
pub struct VectorCoo {
    pub nrows: usize,
    pub rows: Vec<Index>,
    pub values: Vec<Value>,
}

/// Dense vector block: a presence mask over the full block height plus a
/// value for every present slot (`values[i]` is meaningful iff `mask[i]`).
#[derive(Clone, Debug)]
pub struct VectorDense {
    pub nrows: usize,
    pub mask: Vec<bool>,
    pub values: Vec<Value>,
    pub nvals: usize,
}

/// A vector block in one of the supported formats.
#[derive(Clone, Debug)]
pub enum VectorBlock {
    Coo(VectorCoo),
    Dense(VectorDense),
}

impl VectorBlock {
    pub fn coo(nrows: usize, rows: Vec<Index>, values: Vec<Value>) -> Self {
        debug_assert!(rows.windows(2).all(|w| w[0] < w[1]), "coo rows must be strictly sorted");
        debug_assert!(rows.iter().all(|&r| (r as usize) < nrows), "coo rows must be block-relative");
        debug_assert!(values.is_empty() || values.len() == rows.len());
        VectorBlock::Coo(VectorCoo { nrows, rows, values })
    }

    pub fn dense(nrows: usize, mask: Vec<bool>, values: Vec<Value>) -> Self {
        debug_assert_eq!(mask.len(), nrows);
        debug_assert!(values.is_empty() || values.len() == nrows);
        let nvals = mask.iter().filter(|&&m| m).count();
        VectorBlock::Dense(VectorDense {
            nrows,
            mask,
            values,
            nvals,
        })
    }

    /// Format tag.
    pub fn format(&self) -> VectorFormat {
        match self {
            VectorBlock::Coo(_) => VectorFormat::Coo,
            VectorBlock::Dense(_) => VectorFormat::Dense,
        }
    }

    /// Logical height of the block region.
    pub fn nrows(&self) -> usize {
        match self {
            VectorBlock::Coo(b) => b.nrows,
            VectorBlock::Dense(b) => b.nrows,
        }
    }

    /// Number of stored entries.
    pub fn nvals(&self) -> usize {
        match self {
            VectorBlock::Coo(b) => b.rows.len(),
            VectorBlock::Dense(b) => b.nvals,
        }
    }

    pub fn as_coo(&self) -> Option<&VectorCoo> {
        match self {
            VectorBlock::Coo(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dense(&self) -> Option<&VectorDense> {
        match self {
            VectorBlock::Dense(b) => Some(b),
            _ => None,
        }
    }
}

/// Sparse coordinate matrix block, sorted by `(row, col)`.
#[derive(Clone, Debug)]
pub struct MatrixCoo {
    pub nrows: usize,
    pub ncols: usize,
    pub rows: Vec<Index>,
    pub cols: Vec<Index>,
    pub values: Vec<Value>,
}

/// Compressed-row matrix block: `offsets.len() == nrows + 1`, columns
/// sorted within each row.
#[derive(Clone, Debug)]
pub struct MatrixCsr {
    pub nrows: usize,
    pub ncols: usize,
    pub offsets: Vec<Index>,
    pub cols: Vec<Index>,
    pub values: Vec<Value>,
}

/// List-of-lists matrix block: one sorted `(col, value)` list per row.
#[derive(Clone, Debug)]
pub struct MatrixLil {
    pub nrows: usize,
    pub ncols: usize,
    pub rows: Vec<Vec<(Index, Value)>>,
    pub nvals: usize,
}

/// A matrix block in one of the supported formats.
#[derive(Clone, Debug)]
pub enum MatrixBlock {
    Coo(MatrixCoo),
    Csr(MatrixCsr),
    Lil(MatrixLil),
}

impl MatrixBlock {
    pub fn coo(
        nrows: usize,
        ncols: usize,
        rows: Vec<Index>,
        cols: Vec<Index>,
        values: Vec<Value>,
    ) -> Self {
        debug_assert_eq!(rows.len(), cols.len());
        debug_assert!(values.is_empty() || values.len() == rows.len());
        debug_assert!(rows.iter().all(|&r| (r as usize) < nrows));
        debug_assert!(cols.iter().all(|&c| (c as usize) < ncols));
        debug_assert!(
            rows.windows(2).zip(cols.windows(2)).all(|(r, c)| (r[0], c[0]) < (r[1], c[1])),
            "coo entries must be strictly sorted by (row, col)"
        );
        MatrixBlock::Coo(MatrixCoo {
            nrows,
            ncols,
            rows,
            cols,
            values,
        })
    }

    pub fn csr(
        nrows: usize,
        ncols: usize,
        offsets: Vec<Index>,
        cols: Vec<Index>,
        values: Vec<Value>,
    ) -> Self {
        debug_assert_eq!(offsets.len(), nrows + 1);
        debug_assert_eq!(*offsets.last().unwrap_or(&0) as usize, cols.len());
        debug_assert!(values.is_empty() || values.len() == cols.len());
        MatrixBlock::Csr(MatrixCsr {
            nrows,
            ncols,
            offsets,
            cols,
            values,
        })
    }

    pub fn lil(nrows: usize, ncols: usize, rows: Vec<Vec<(Index, Value)>>) -> Self {
        debug_assert_eq!(rows.len(), nrows);
        let nvals = rows.iter().map(Vec::len).sum();
        MatrixBlock::Lil(MatrixLil {
            nrows,
            ncols,
            rows,
            nvals,
        })
    }

    /// Format tag.
    pub fn format(&self) -> MatrixFormat {
        match self {
            MatrixBlock::Coo(_) => MatrixFormat::Coo,
            MatrixBlock::Csr(_) => MatrixFormat::Csr,
            MatrixBlock::Lil(_) => MatrixFormat::Lil,
        }
    }

    /// Logical height of the block region.
    pub fn nrows(&self) -> usize {
        match self {
            MatrixBlock::Coo(b) => b.nrows,
            MatrixBlock::Csr(b) => b.nrows,
            MatrixBlock::Lil(b) => b.nrows,
        }
    }

    /// Logical width of the block region.
    pub fn ncols(&self) -> usize {
        match self {
            MatrixBlock::Coo(b) => b.ncols,
            MatrixBlock::Csr(b) => b.ncols,
            MatrixBlock::Lil(b) => b.ncols,
        }
    }

    /// Number of stored entries.
    pub fn nvals(&self) -> usize {
        match self {
            MatrixBlock::Coo(b) => b.rows.len(),
            MatrixBlock::Csr(b) => b.cols.len(),
            MatrixBlock::Lil(b) => b.nvals,
        }
    }

    pub fn as_coo(&self) -> Option<&MatrixCoo> {
        match self {
            MatrixBlock::Coo(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_csr(&self) -> Option<&MatrixCsr> {
        match self {
            MatrixBlock::Csr(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_lil(&self) -> Option<&MatrixLil> {
        match self {
            MatrixBlock::Lil(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_coo_counts() {
        let b = VectorBlock::coo(8, vec![1, 3, 7], vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
        assert_eq!(b.format(), VectorFormat::Coo);
        assert_eq!(b.nrows(), 8);
        assert_eq!(b.nvals(), 3);
    }

    #[test]
    fn vector_dense_counts_mask() {
        let b = VectorBlock::dense(
            4,
            vec![true, false, true, false],
            vec![Value::Int32(5), Value::Int32(0), Value::Int32(7), Value::Int32(0)],
        );
        assert_eq!(b.format(), VectorFormat::Dense);
        assert_eq!(b.nvals(), 2);
    }

    #[test]
    fn void_blocks_have_no_values() {
        let b = VectorBlock::coo(8, vec![0, 5], vec![]);
        assert_eq!(b.nvals(), 2);
        assert!(b.as_coo().unwrap().values.is_empty());
    }

    #[test]
    fn matrix_formats_report_nvals() {
        let coo = MatrixBlock::coo(2, 2, vec![0, 1], vec![1, 0], vec![]);
        assert_eq!(coo.nvals(), 2);
        assert_eq!(coo.format(), MatrixFormat::Coo);

        let csr = MatrixBlock::csr(2, 2, vec![0, 1, 2], vec![1, 0], vec![]);
        assert_eq!(csr.nvals(), 2);
        assert_eq!(csr.format(), MatrixFormat::Csr);

        let lil = MatrixBlock::lil(2, 2, vec![vec![(1, Value::Void)], vec![(0, Value::Void)]]);
        assert_eq!(lil.nvals(), 2);
        assert_eq!(lil.format(), MatrixFormat::Lil);
    }
}
