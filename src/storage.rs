//! Thread-safe block storages for vectors, matrices, and scalars.
//!
//! A storage maps block coordinates to shared block handles and caches the
//! aggregate nnz. Two locking layers exist: a per-call mutex protecting the
//! in-map operations, and the *logical* read/write lock the scheduler
//! acquires around an expression's use of the tensor. The logical lock may
//! be released from a different thread than the one that acquired it (a
//! sink task runs the release), so it is built on a mutex/condvar pair
//! rather than a guard type.
//!
//! Decorations cache derived forms of a block (a transposed view, an
//! alternative storage format). Every mutating call drops all decorations
//! before it returns, so a stale decoration can never be observed after a
//! modifying operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::block::{MatrixBlock, MatrixFormat, VectorBlock, VectorFormat};
use crate::grid::{self, BlockCoord};
use crate::types::Value;

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_storage_id() -> u64 {
    NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Logical shared-read / exclusive-write lock.
///
/// While any reader holds the lock no writer may, and at most one writer
/// exists at any moment. Acquire and release may happen on different
/// threads.
pub struct AccessLock {
    state: Mutex<AccessState>,
    cv: Condvar,
}

#[derive(Default)]
struct AccessState {
    readers: usize,
    writer: bool,
}

impl AccessLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(AccessState::default()),
            cv: Condvar::new(),
        }
    }

    /// Block until a shared read lock is held.
    pub fn lock_read(&self) {
        let mut st = self.state.lock().expect("access lock poisoned");
        while st.writer {
            st = self.cv.wait(st).expect("access lock poisoned");
        }
        st.readers += 1;
    }

    /// Release one shared read lock.
    pub fn unlock_read(&self) {
        let mut st = self.state.lock().expect("access lock poisoned");
        debug_assert!(st.readers > 0);
        st.readers -= 1;
        if st.readers == 0 {
            self.cv.notify_all();
        }
    }

    /// Block until the exclusive write lock is held.
    pub fn lock_write(&self) {
        let mut st = self.state.lock().expect("access lock poisoned");
        while st.writer || st.readers > 0 {
            st = self.cv.wait(st).expect("access lock poisoned");
        }
        st.writer = true;
    }

    /// Release the exclusive write lock.
    pub fn unlock_write(&self) {
        let mut st = self.state.lock().expect("access lock poisoned");
        debug_assert!(st.writer);
        st.writer = false;
        self.cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Vector storage
// ---------------------------------------------------------------------------

struct VectorStorageInner {
    blocks: HashMap<usize, Arc<VectorBlock>>,
    nvals: usize,
    /// Cached alternative-format rendition per block.
    cached_format: HashMap<usize, Arc<VectorBlock>>,
}

/// Block storage of a vector partitioned on the 1-D grid.
pub struct VectorStorage {
    id: u64,
    nrows: usize,
    block_size: usize,
    nblock_rows: usize,
    access: AccessLock,
    inner: Mutex<VectorStorageInner>,
}

impl VectorStorage {
    pub fn new(nrows: usize, block_size: usize) -> crate::error::Result<Arc<Self>> {
        let nblock_rows = grid::block_count(nrows, block_size)?;
        Ok(Arc::new(Self {
            id: next_storage_id(),
            nrows,
            block_size,
            nblock_rows,
            access: AccessLock::new(),
            inner: Mutex::new(VectorStorageInner {
                blocks: HashMap::new(),
                nvals: 0,
                cached_format: HashMap::new(),
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn access(&self) -> &AccessLock {
        &self.access
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn nblock_rows(&self) -> usize {
        self.nblock_rows
    }

    pub fn nvals(&self) -> usize {
        self.inner.lock().expect("vector storage poisoned").nvals
    }

    /// Drop all blocks; nnz becomes zero.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("vector storage poisoned");
        inner.blocks.clear();
        inner.cached_format.clear();
        inner.nvals = 0;
    }

    /// Replace the slot atomically; an absent (or empty) block removes it.
    pub fn set_block(&self, index: usize, block: Option<Arc<VectorBlock>>) {
        debug_assert!(index < self.nblock_rows);
        let mut inner = self.inner.lock().expect("vector storage poisoned");
        let old = match &block {
            Some(b) if b.nvals() > 0 => inner.blocks.insert(index, b.clone()),
            _ => inner.blocks.remove(&index),
        };
        let old_nvals = old.map(|b| b.nvals()).unwrap_or(0);
        let new_nvals = block.as_ref().map(|b| b.nvals()).unwrap_or(0);
        inner.nvals = inner.nvals + new_nvals - old_nvals;
        inner.cached_format.clear();
    }

    /// Remove the slot if present.
    pub fn remove_block(&self, index: usize) {
        self.set_block(index, None);
    }

    /// Clone the shared block handle at `index`, if any.
    pub fn get_block(&self, index: usize) -> Option<Arc<VectorBlock>> {
        self.inner
            .lock()
            .expect("vector storage poisoned")
            .blocks
            .get(&index)
            .cloned()
    }

    /// Snapshot of present blocks, sorted by block index.
    pub fn blocks(&self) -> Vec<(usize, Arc<VectorBlock>)> {
        let inner = self.inner.lock().expect("vector storage poisoned");
        let mut out: Vec<_> = inner
            .blocks
            .iter()
            .map(|(&i, b)| (i, b.clone()))
            .collect();
        out.sort_by_key(|(i, _)| *i);
        out
    }

    /// Cached alternative-format rendition of the block at `index`, built on
    /// first demand and dropped by every mutating call.
    pub fn block_in_format(&self, index: usize, format: VectorFormat, fill: &Value) -> Option<Arc<VectorBlock>> {
        let mut inner = self.inner.lock().expect("vector storage poisoned");
        let block = inner.blocks.get(&index)?.clone();
        if block.format() == format {
            return Some(block);
        }
        if let Some(cached) = inner.cached_format.get(&index) {
            if cached.format() == format {
                return Some(cached.clone());
            }
        }
        let converted = Arc::new(match format {
            VectorFormat::Dense => crate::primitives::vector_to_dense(&block, fill),
            VectorFormat::Coo => VectorBlock::Coo(crate::primitives::vector_to_coo(&block)),
        });
        inner.cached_format.insert(index, converted.clone());
        Some(converted)
    }
}

// ---------------------------------------------------------------------------
// Matrix storage
// ---------------------------------------------------------------------------

struct MatrixStorageInner {
    blocks: HashMap<BlockCoord, Arc<MatrixBlock>>,
    nvals: usize,
    /// Cached transposed rendition of individual blocks, keyed by the
    /// *destination* coordinate of the transposed view.
    cached_transpose: HashMap<BlockCoord, Arc<MatrixBlock>>,
    /// Cached alternative-format rendition per block.
    cached_format: HashMap<BlockCoord, Arc<MatrixBlock>>,
}

/// Block storage of a matrix partitioned on the 2-D grid.
pub struct MatrixStorage {
    id: u64,
    nrows: usize,
    ncols: usize,
    block_size: usize,
    nblock_rows: usize,
    nblock_cols: usize,
    access: AccessLock,
    inner: Mutex<MatrixStorageInner>,
}

impl MatrixStorage {
    pub fn new(nrows: usize, ncols: usize, block_size: usize) -> crate::error::Result<Arc<Self>> {
        let nblock_rows = grid::block_count(nrows, block_size)?;
        let nblock_cols = grid::block_count(ncols, block_size)?;
        Ok(Arc::new(Self {
            id: next_storage_id(),
            nrows,
            ncols,
            block_size,
            nblock_rows,
            nblock_cols,
            access: AccessLock::new(),
            inner: Mutex::new(MatrixStorageInner {
                blocks: HashMap::new(),
                nvals: 0,
                cached_transpose: HashMap::new(),
                cached_format: HashMap::new(),
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn access(&self) -> &AccessLock {
        &self.access
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn nblock_rows(&self) -> usize {
        self.nblock_rows
    }

    pub fn nblock_cols(&self) -> usize {
        self.nblock_cols
    }

    pub fn nvals(&self) -> usize {
        self.inner.lock().expect("matrix storage poisoned").nvals
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("matrix storage poisoned");
        inner.blocks.clear();
        inner.cached_transpose.clear();
        inner.cached_format.clear();
        inner.nvals = 0;
    }

    pub fn set_block(&self, coord: BlockCoord, block: Option<Arc<MatrixBlock>>) {
        debug_assert!(coord.row < self.nblock_rows && coord.col < self.nblock_cols);
        let mut inner = self.inner.lock().expect("matrix storage poisoned");
        let old = match &block {
            Some(b) if b.nvals() > 0 => inner.blocks.insert(coord, b.clone()),
            _ => inner.blocks.remove(&coord),
        };
        let old_nvals = old.map(|b| b.nvals()).unwrap_or(0);
        let new_nvals = block.as_ref().map(|b| b.nvals()).unwrap_or(0);
        inner.nvals = inner.nvals + new_nvals - old_nvals;
        inner.cached_transpose.clear();
        inner.cached_format.clear();
    }

    pub fn remove_block(&self, coord: BlockCoord) {
        self.set_block(coord, None);
    }

    pub fn get_block(&self, coord: BlockCoord) -> Option<Arc<MatrixBlock>> {
        self.inner
            .lock()
            .expect("matrix storage poisoned")
            .blocks
            .get(&coord)
            .cloned()
    }

    /// Snapshot of present blocks, sorted row-major by coordinate.
    pub fn blocks(&self) -> Vec<(BlockCoord, Arc<MatrixBlock>)> {
        let inner = self.inner.lock().expect("matrix storage poisoned");
        let mut out: Vec<_> = inner
            .blocks
            .iter()
            .map(|(&c, b)| (c, b.clone()))
            .collect();
        out.sort_by_key(|(c, _)| (c.row, c.col));
        out
    }

    /// Cached transposed rendition of the source block `(coord.col,
    /// coord.row)`, i.e. the block the transposed view holds at `coord`.
    pub fn transposed_block(&self, coord: BlockCoord) -> Option<Arc<MatrixBlock>> {
        let mut inner = self.inner.lock().expect("matrix storage poisoned");
        if let Some(cached) = inner.cached_transpose.get(&coord) {
            return Some(cached.clone());
        }
        let src = inner.blocks.get(&coord.transposed())?.clone();
        let (mut rows, mut cols, mut values) = crate::primitives::matrix_entries(&src);
        std::mem::swap(&mut rows, &mut cols);
        crate::primitives::sort_by_row_col(&mut rows, &mut cols, &mut values);
        let block = Arc::new(MatrixBlock::coo(src.ncols(), src.nrows(), rows, cols, values));
        inner.cached_transpose.insert(coord, block.clone());
        Some(block)
    }

    /// Cached alternative-format rendition of the block at `coord`.
    pub fn block_in_format(&self, coord: BlockCoord, format: MatrixFormat) -> Option<Arc<MatrixBlock>> {
        let mut inner = self.inner.lock().expect("matrix storage poisoned");
        let block = inner.blocks.get(&coord)?.clone();
        if block.format() == format {
            return Some(block);
        }
        if let Some(cached) = inner.cached_format.get(&coord) {
            if cached.format() == format {
                return Some(cached.clone());
            }
        }
        let converted = Arc::new(match format {
            MatrixFormat::Csr => crate::primitives::matrix_to_csr(&block),
            MatrixFormat::Lil => crate::primitives::matrix_to_lil(&block),
            MatrixFormat::Coo => MatrixBlock::Coo(crate::primitives::matrix_to_coo(&block)),
        });
        inner.cached_format.insert(coord, converted.clone());
        Some(converted)
    }
}

// ---------------------------------------------------------------------------
// Scalar storage
// ---------------------------------------------------------------------------

/// Storage of a single optional value.
pub struct ScalarStorage {
    id: u64,
    access: AccessLock,
    value: Mutex<Option<Value>>,
}

impl ScalarStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_storage_id(),
            access: AccessLock::new(),
            value: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn access(&self) -> &AccessLock {
        &self.access
    }

    pub fn get(&self) -> Option<Value> {
        self.value.lock().expect("scalar storage poisoned").clone()
    }

    pub fn set(&self, value: Option<Value>) {
        *self.value.lock().expect("scalar storage poisoned") = value;
    }
}

/// A storage handle of any shape class, as the scheduler sees it.
#[derive(Clone)]
pub enum StorageRef {
    Vector(Arc<VectorStorage>),
    Matrix(Arc<MatrixStorage>),
    Scalar(Arc<ScalarStorage>),
}

impl StorageRef {
    pub fn id(&self) -> u64 {
        match self {
            StorageRef::Vector(s) => s.id(),
            StorageRef::Matrix(s) => s.id(),
            StorageRef::Scalar(s) => s.id(),
        }
    }

    pub fn access(&self) -> &AccessLock {
        match self {
            StorageRef::Vector(s) => s.access(),
            StorageRef::Matrix(s) => s.access(),
            StorageRef::Scalar(s) => s.access(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn vblock(nrows: usize, rows: Vec<u32>) -> Arc<VectorBlock> {
        let values = rows.iter().map(|&r| Value::Int32(r as i32)).collect();
        Arc::new(VectorBlock::coo(nrows, rows, values))
    }

    #[test]
    fn nvals_tracks_block_swaps() {
        let s = VectorStorage::new(10, 4).unwrap();
        assert_eq!(s.nblock_rows(), 3);
        s.set_block(0, Some(vblock(4, vec![0, 2])));
        s.set_block(2, Some(vblock(2, vec![1])));
        assert_eq!(s.nvals(), 3);
        s.set_block(0, Some(vblock(4, vec![1])));
        assert_eq!(s.nvals(), 2);
        s.remove_block(2);
        assert_eq!(s.nvals(), 1);
        s.clear();
        assert_eq!(s.nvals(), 0);
    }

    #[test]
    fn empty_block_removes_slot() {
        let s = VectorStorage::new(8, 4).unwrap();
        s.set_block(1, Some(vblock(4, vec![0])));
        assert!(s.get_block(1).is_some());
        s.set_block(1, Some(Arc::new(VectorBlock::coo(4, vec![], vec![]))));
        assert!(s.get_block(1).is_none());
        assert_eq!(s.nvals(), 0);
    }

    #[test]
    fn blocks_snapshot_is_sorted() {
        let s = VectorStorage::new(12, 4).unwrap();
        s.set_block(2, Some(vblock(4, vec![0])));
        s.set_block(0, Some(vblock(4, vec![1])));
        let snap = s.blocks();
        let indices: Vec<usize> = snap.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn matrix_transpose_decoration_is_invalidated_on_write() {
        let s = MatrixStorage::new(4, 4, 2).unwrap();
        let block = Arc::new(MatrixBlock::coo(2, 2, vec![0], vec![1], vec![Value::Int32(7)]));
        s.set_block(BlockCoord::new(0, 1), Some(block));

        // Transposed view of (1, 0) reads source block (0, 1).
        let t = s.transposed_block(BlockCoord::new(1, 0)).unwrap();
        let coo = t.as_coo().unwrap();
        assert_eq!((coo.rows[0], coo.cols[0]), (1, 0));

        // A write drops the decoration; the next read rebuilds from fresh data.
        s.set_block(BlockCoord::new(0, 1), None);
        assert!(s.transposed_block(BlockCoord::new(1, 0)).is_none());
    }

    #[test]
    fn format_decoration_round_trips() {
        let s = MatrixStorage::new(4, 4, 2).unwrap();
        let block = Arc::new(MatrixBlock::coo(
            2,
            2,
            vec![0, 1],
            vec![0, 1],
            vec![Value::Int32(1), Value::Int32(2)],
        ));
        s.set_block(BlockCoord::new(0, 0), Some(block));
        let csr = s
            .block_in_format(BlockCoord::new(0, 0), MatrixFormat::Csr)
            .unwrap();
        assert_eq!(csr.format(), MatrixFormat::Csr);
        assert_eq!(csr.nvals(), 2);
        // Original format untouched.
        assert_eq!(
            s.get_block(BlockCoord::new(0, 0)).unwrap().format(),
            MatrixFormat::Coo
        );
    }

    #[test]
    fn access_lock_excludes_writers() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let s = VectorStorage::new(4, 4).unwrap();
        s.access().lock_read();

        let s2 = s.clone();
        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        let h = std::thread::spawn(move || {
            s2.access().lock_write();
            flag.store(true, Ordering::SeqCst);
            s2.access().unlock_write();
        });

        std::thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        s.access().unlock_read();
        h.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn scalar_storage_holds_optional_value() {
        let s = ScalarStorage::new();
        assert!(s.get().is_none());
        s.set(Some(Value::Int32(15)));
        assert_eq!(s.get(), Some(Value::Int32(15)));
    }
}
