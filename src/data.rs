//! Host data buffers for bulk ingress and egress.
//!
//! A data handle owns its index/value buffers and optionally a release
//! callback invoked exactly once when the last handle drops. Ingress
//! (`DataWrite`) consumes the buffers' declared entries; egress
//! (`DataRead`) scatters into them and fails with `InvalidArgument` when
//! the declared capacity cannot hold the tensor's entries.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::grid::Index;
use crate::types::Value;

type ReleaseFn = Box<dyn FnOnce() + Send>;

struct Buffers {
    rows: Vec<Index>,
    cols: Vec<Index>,
    values: Vec<Value>,
    nvals: usize,
}

struct DataInner {
    buffers: Mutex<Buffers>,
    capacity: usize,
    release: Mutex<Option<ReleaseFn>>,
}

impl Drop for DataInner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.release.lock() {
            if let Some(f) = slot.take() {
                f();
            }
        }
    }
}

impl DataInner {
    fn new(rows: Vec<Index>, cols: Vec<Index>, values: Vec<Value>, capacity: usize) -> Arc<Self> {
        let nvals = rows.len();
        Arc::new(Self {
            buffers: Mutex::new(Buffers {
                rows,
                cols,
                values,
                nvals,
            }),
            capacity,
            release: Mutex::new(None),
        })
    }

    fn set_release(&self, f: ReleaseFn) {
        *self.release.lock().expect("data release slot poisoned") = Some(f);
    }

    fn store(&self, rows: Vec<Index>, cols: Vec<Index>, values: Vec<Value>) -> Result<()> {
        if rows.len() > self.capacity {
            return Err(Error::invalid_argument(format!(
                "data buffers hold {} entries but {} are required",
                self.capacity,
                rows.len()
            )));
        }
        let mut b = self.buffers.lock().expect("data buffers poisoned");
        b.nvals = rows.len();
        b.rows = rows;
        b.cols = cols;
        b.values = values;
        Ok(())
    }
}

/// Host buffer of `(row, value)` pairs backing vector ingress/egress.
#[derive(Clone)]
pub struct DataVector {
    inner: Arc<DataInner>,
}

impl DataVector {
    /// Wrap filled buffers for ingress. `values` is empty for structure-only
    /// data (`void` tensors), otherwise it must match `rows` in length.
    pub fn make(rows: Vec<Index>, values: Vec<Value>) -> Result<Self> {
        if !values.is_empty() && values.len() != rows.len() {
            return Err(Error::invalid_argument(format!(
                "row and value buffers disagree: {} rows vs {} values",
                rows.len(),
                values.len()
            )));
        }
        let capacity = rows.len();
        Ok(Self {
            inner: DataInner::new(rows, Vec::new(), values, capacity),
        })
    }

    /// Allocate empty buffers able to receive `capacity` entries on egress.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: DataInner::new(Vec::new(), Vec::new(), Vec::new(), capacity),
        }
    }

    /// Install a release callback run when the last handle drops.
    pub fn on_release(self, f: impl FnOnce() + Send + 'static) -> Self {
        self.inner.set_release(Box::new(f));
        self
    }

    /// Number of valid entries currently in the buffers.
    pub fn nvals(&self) -> usize {
        self.inner.buffers.lock().expect("data buffers poisoned").nvals
    }

    /// Declared buffer capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn rows(&self) -> Vec<Index> {
        self.inner.buffers.lock().expect("data buffers poisoned").rows.clone()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner
            .buffers
            .lock()
            .expect("data buffers poisoned")
            .values
            .clone()
    }

    pub(crate) fn store(&self, rows: Vec<Index>, values: Vec<Value>) -> Result<()> {
        self.inner.store(rows, Vec::new(), values)
    }
}

/// Host buffer of `(row, col, value)` triples backing matrix ingress/egress.
#[derive(Clone)]
pub struct DataMatrix {
    inner: Arc<DataInner>,
}

impl DataMatrix {
    /// Wrap filled buffers for ingress.
    pub fn make(rows: Vec<Index>, cols: Vec<Index>, values: Vec<Value>) -> Result<Self> {
        if rows.len() != cols.len() {
            return Err(Error::invalid_argument(format!(
                "row and column buffers disagree: {} rows vs {} cols",
                rows.len(),
                cols.len()
            )));
        }
        if !values.is_empty() && values.len() != rows.len() {
            return Err(Error::invalid_argument(format!(
                "index and value buffers disagree: {} indices vs {} values",
                rows.len(),
                values.len()
            )));
        }
        let capacity = rows.len();
        Ok(Self {
            inner: DataInner::new(rows, cols, values, capacity),
        })
    }

    /// Allocate empty buffers able to receive `capacity` entries on egress.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: DataInner::new(Vec::new(), Vec::new(), Vec::new(), capacity),
        }
    }

    /// Install a release callback run when the last handle drops.
    pub fn on_release(self, f: impl FnOnce() + Send + 'static) -> Self {
        self.inner.set_release(Box::new(f));
        self
    }

    pub fn nvals(&self) -> usize {
        self.inner.buffers.lock().expect("data buffers poisoned").nvals
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn rows(&self) -> Vec<Index> {
        self.inner.buffers.lock().expect("data buffers poisoned").rows.clone()
    }

    pub fn cols(&self) -> Vec<Index> {
        self.inner.buffers.lock().expect("data buffers poisoned").cols.clone()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner
            .buffers
            .lock()
            .expect("data buffers poisoned")
            .values
            .clone()
    }

    pub(crate) fn store(&self, rows: Vec<Index>, cols: Vec<Index>, values: Vec<Value>) -> Result<()> {
        self.inner.store(rows, cols, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn release_runs_once_on_last_drop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let data = DataVector::make(vec![0, 1], vec![Value::Int32(1), Value::Int32(2)])
            .unwrap()
            .on_release(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        let clone = data.clone();
        drop(data);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        assert!(DataVector::make(vec![0, 1], vec![Value::Int32(1)]).is_err());
        assert!(DataMatrix::make(vec![0], vec![0, 1], vec![]).is_err());
    }

    #[test]
    fn store_respects_capacity() {
        let data = DataVector::with_capacity(1);
        assert!(data.store(vec![0], vec![Value::Int32(1)]).is_ok());
        assert_eq!(data.nvals(), 1);
        let err = data.store(vec![0, 1], vec![]).unwrap_err();
        assert_eq!(err.status(), crate::error::Status::InvalidArgument);
    }
}
