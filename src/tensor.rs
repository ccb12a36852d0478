//! User-facing tensor handles: `Vector`, `Matrix`, and `Scalar`.
//!
//! A tensor handle pairs an element type with a shared block storage. The
//! handle is cheap to clone; the storage lives until the last holder drops
//! it. Mutation inside the core happens only under the storage's logical
//! write lock, held for the duration of an expression's use.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::grid::Index;
use crate::storage::{MatrixStorage, ScalarStorage, StorageRef, VectorStorage};
use crate::types::{Type, Value};
use crate::Library;

/// A sparse vector of logical length `nrows`.
#[derive(Clone)]
pub struct Vector {
    ty: Arc<Type>,
    storage: Arc<VectorStorage>,
}

impl Vector {
    /// Create an empty vector.
    pub fn make(nrows: usize, ty: &Arc<Type>, library: &Library) -> Result<Self> {
        if nrows == 0 {
            return Err(Error::invalid_argument("vector length must be positive"));
        }
        Ok(Self {
            ty: ty.clone(),
            storage: VectorStorage::new(nrows, library.block_size())?,
        })
    }

    pub fn nrows(&self) -> usize {
        self.storage.nrows()
    }

    pub fn nvals(&self) -> usize {
        self.storage.nvals()
    }

    pub fn element_type(&self) -> &Arc<Type> {
        &self.ty
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.storage.clear();
    }

    pub(crate) fn storage(&self) -> &Arc<VectorStorage> {
        &self.storage
    }

    pub(crate) fn storage_ref(&self) -> StorageRef {
        StorageRef::Vector(self.storage.clone())
    }

    /// Gather all entries with global indices, sorted. Debugging and test
    /// accessor; bulk egress goes through `DataRead` expressions.
    pub fn entries(&self) -> Vec<(Index, Value)> {
        let block_size = self.storage.block_size();
        let mut out = Vec::with_capacity(self.nvals());
        for (idx, block) in self.storage.blocks() {
            let base = (idx * block_size) as Index;
            let (rows, values) = crate::primitives::vector_entries(&block);
            for (k, r) in rows.iter().enumerate() {
                out.push((base + r, crate::primitives::value_at(&values, k)));
            }
        }
        out
    }
}

/// A sparse matrix of logical shape `nrows × ncols`.
#[derive(Clone)]
pub struct Matrix {
    ty: Arc<Type>,
    storage: Arc<MatrixStorage>,
}

impl Matrix {
    /// Create an empty matrix.
    pub fn make(nrows: usize, ncols: usize, ty: &Arc<Type>, library: &Library) -> Result<Self> {
        if nrows == 0 || ncols == 0 {
            return Err(Error::invalid_argument("matrix dimensions must be positive"));
        }
        Ok(Self {
            ty: ty.clone(),
            storage: MatrixStorage::new(nrows, ncols, library.block_size())?,
        })
    }

    pub fn nrows(&self) -> usize {
        self.storage.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.storage.ncols()
    }

    pub fn nvals(&self) -> usize {
        self.storage.nvals()
    }

    pub fn element_type(&self) -> &Arc<Type> {
        &self.ty
    }

    pub fn clear(&self) {
        self.storage.clear();
    }

    pub(crate) fn storage(&self) -> &Arc<MatrixStorage> {
        &self.storage
    }

    pub(crate) fn storage_ref(&self) -> StorageRef {
        StorageRef::Matrix(self.storage.clone())
    }

    /// Gather all triples with global indices, `(row, col)`-sorted.
    pub fn entries(&self) -> Vec<(Index, Index, Value)> {
        let block_size = self.storage.block_size();
        let mut out = Vec::with_capacity(self.nvals());
        for (coord, block) in self.storage.blocks() {
            let row_base = (coord.row * block_size) as Index;
            let col_base = (coord.col * block_size) as Index;
            let (rows, cols, values) = crate::primitives::matrix_entries(&block);
            for k in 0..rows.len() {
                out.push((
                    row_base + rows[k],
                    col_base + cols[k],
                    crate::primitives::value_at(&values, k),
                ));
            }
        }
        out.sort_by_key(|&(r, c, _)| ((r as u64) << 32) | c as u64);
        out
    }
}

/// A typed optional value holder; semantically a 1×1 tensor, implemented as
/// a separate shape class for clarity.
#[derive(Clone)]
pub struct Scalar {
    ty: Arc<Type>,
    storage: Arc<ScalarStorage>,
}

impl Scalar {
    /// Create an empty scalar.
    pub fn make(ty: &Arc<Type>, _library: &Library) -> Self {
        Self {
            ty: ty.clone(),
            storage: ScalarStorage::new(),
        }
    }

    /// Create a scalar holding `value`.
    pub fn with_value(ty: &Arc<Type>, value: Value, library: &Library) -> Result<Self> {
        value.check_type(ty)?;
        let s = Self::make(ty, library);
        s.storage.set(Some(value));
        Ok(s)
    }

    pub fn element_type(&self) -> &Arc<Type> {
        &self.ty
    }

    /// Whether a value is present.
    pub fn has_value(&self) -> bool {
        self.storage.get().is_some()
    }

    /// Current value, if any.
    pub fn value(&self) -> Option<Value> {
        self.storage.get()
    }

    /// Replace the held value.
    pub fn set_value(&self, value: Value) -> Result<()> {
        value.check_type(&self.ty)?;
        self.storage.set(Some(value));
        Ok(())
    }

    pub fn clear(&self) {
        self.storage.set(None);
    }

    pub(crate) fn storage(&self) -> &Arc<ScalarStorage> {
        &self.storage
    }

    pub(crate) fn storage_ref(&self) -> StorageRef {
        StorageRef::Scalar(self.storage.clone())
    }
}
