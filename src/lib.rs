//! Crate root: public surface, core aliases, and library-wide invariants.
//!
//! `sparla` is a sparse linear algebra library over user-chosen semirings.
//! Tensors are decomposed into fixed-size blocks on a 1-D or 2-D grid and
//! computations are described as DAGs of primitive operations; submitted
//! expressions run asynchronously as per-block tasks on an internal worker
//! pool, each task dispatching through a registry of per-format algorithms
//! onto a chosen compute device.
//!
//! ## Invariants
//!
//! - **Block grid.** The block size is chosen once per [`Library`]; all
//!   tensors of that instance share it, and the final block of a dimension
//!   is short when the dimension is not a multiple of the block size.
//! - **Metadata.** A tensor's `nvals` always equals the sum of its blocks'
//!   `nvals`; block-internal indices are block-relative; an empty slot is
//!   absent, never an empty block.
//! - **Locking.** The scheduler takes per-storage logical read/write locks
//!   for the lifetime of an expression's use: readers share, writers
//!   exclude, and submission order decides between expressions.
//! - **Failure.** The first task failure cancels the rest of the graph,
//!   finalize hooks still run, and the expression ends `Aborted` with the
//!   error recorded. The library never aborts the process.
//!
//! The failure mode of every API is a precise [`Error`], never UB; the
//! crate forbids `unsafe` throughout.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

pub mod block;
pub mod data;
pub mod descriptor;
pub mod devices;
pub mod error;
pub mod expression;
pub mod grid;
pub mod ops;
pub mod primitives;
pub mod storage;
pub mod tensor;
pub mod types;

mod algo;
mod pool;
mod processors;
mod registry;
mod schedule;

pub use crate::data::{DataMatrix, DataVector};
pub use crate::descriptor::{Descriptor, Param};
pub use crate::devices::{DeviceAmount, DeviceType};
pub use crate::error::{Error, Result, Status};
pub use crate::expression::{Expression, ExpressionState, NodeId};
pub use crate::grid::Index;
pub use crate::ops::{BinaryOp, OpCatalogue, SelectOp, UnaryOp};
pub use crate::tensor::{Matrix, Scalar, Vector};
pub use crate::types::{ElemKind, Type, TypeCatalogue, Value};

use crate::devices::DeviceManager;
use crate::pool::{Pool, PoolShared};
use crate::processors::EngineEnv;
use crate::registry::AlgorithmRegistry;

/// System configuration used in all computations of one library instance.
#[derive(Clone, Debug)]
pub struct LibraryConfig {
    /// Kind of compute device to claim.
    pub device_type: DeviceType,
    /// How many matching devices to claim.
    pub device_amount: DeviceAmount,
    /// Restrict to a named platform; `None` accepts any.
    pub platform_name: Option<String>,
    /// Restrict to specific device names; `None` accepts any.
    pub device_names: Option<Vec<String>>,
    /// Block size shared by every tensor of the instance.
    pub block_size: usize,
    /// Worker threads; defaults to the host core count.
    pub workers_count: Option<usize>,
    /// Optional log file receiving the library's structured records.
    pub log_file: Option<PathBuf>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Gpu,
            device_amount: DeviceAmount::All,
            platform_name: None,
            device_names: None,
            block_size: 1024,
            workers_count: None,
            log_file: None,
        }
    }
}

impl LibraryConfig {
    pub fn with_device_type(mut self, ty: DeviceType) -> Self {
        self.device_type = ty;
        self
    }

    pub fn with_device_amount(mut self, amount: DeviceAmount) -> Self {
        self.device_amount = amount;
        self
    }

    pub fn with_platform_name(mut self, name: impl Into<String>) -> Self {
        self.platform_name = Some(name.into());
        self
    }

    pub fn with_device_names(mut self, names: Vec<String>) -> Self {
        self.device_names = Some(names);
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_workers_count(mut self, workers: usize) -> Self {
        self.workers_count = Some(workers);
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

struct LibraryInner {
    config: LibraryConfig,
    types: TypeCatalogue,
    ops: OpCatalogue,
    env: Arc<EngineEnv>,
    pool: Pool,
}

/// Primary access point to the library.
///
/// Encapsulates global state: the type and operator catalogues, the device
/// manager, the algorithm registry, and the worker pool. Handles are cheap
/// to clone and share the same instance.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").finish_non_exhaustive()
    }
}

impl Library {
    /// Construct a library instance; fails with `DeviceNotPresent` when no
    /// device matches the configuration.
    pub fn new(config: LibraryConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(Error::invalid_argument("block size must be positive"));
        }
        if let Some(path) = &config.log_file {
            init_file_logging(path)?;
        }
        let devices = devices::discover(&config)?;
        tracing::debug!(count = devices.len(), "devices claimed");

        let mut registry = AlgorithmRegistry::new();
        algo::register_all(&mut registry);

        let workers = config
            .workers_count
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1);

        let env = Arc::new(EngineEnv {
            devices: DeviceManager::new(devices),
            registry,
        });

        Ok(Self {
            inner: Arc::new(LibraryInner {
                config,
                types: TypeCatalogue::new(),
                ops: OpCatalogue::new(),
                env,
                pool: Pool::new(workers),
            }),
        })
    }

    /// Block size shared by every tensor of this instance.
    pub fn block_size(&self) -> usize {
        self.inner.config.block_size
    }

    /// Number of claimed compute devices.
    pub fn device_count(&self) -> usize {
        self.inner.env.devices.device_count()
    }

    /// The element type catalogue.
    pub fn types(&self) -> &TypeCatalogue {
        &self.inner.types
    }

    /// The standard operator catalogue.
    pub fn ops(&self) -> &OpCatalogue {
        &self.inner.ops
    }

    /// Submit an expression for asynchronous evaluation.
    ///
    /// Validation failures abort the expression before any task runs and
    /// surface as the returned error.
    pub fn submit(&self, expression: &Expression) -> Result<()> {
        schedule::submit(self, expression)
    }

    pub(crate) fn env(&self) -> &Arc<EngineEnv> {
        &self.inner.env
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub(crate) fn pool_shared(&self) -> Arc<PoolShared> {
        self.inner.pool.shared()
    }
}

/// Route the library's records to `path`; records carry level, file, line,
/// and message. Safe to call once per process; later calls keep the first
/// subscriber.
fn init_file_logging(path: &std::path::Path) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::generic(format!("cannot open log file {}: {e}", path.display())))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_builds_with_defaults() {
        let library = Library::new(LibraryConfig::default().with_block_size(16)).unwrap();
        assert_eq!(library.block_size(), 16);
        assert!(library.device_count() >= 1);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let err = Library::new(LibraryConfig::default().with_block_size(0)).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn unknown_platform_fails_device_discovery() {
        let err = Library::new(LibraryConfig::default().with_platform_name("quantum-cluster"))
            .unwrap_err();
        assert_eq!(err.status(), Status::DeviceNotPresent);
    }

    #[test]
    fn empty_device_selection_fails() {
        let err =
            Library::new(LibraryConfig::default().with_device_names(vec!["no-such-device".into()]))
                .unwrap_err();
        assert_eq!(err.status(), Status::DeviceNotPresent);
    }

    #[test]
    fn log_file_is_created_on_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparla.log");
        let library = Library::new(
            LibraryConfig::default()
                .with_block_size(8)
                .with_log_file(path.clone()),
        )
        .unwrap();
        drop(library);
        assert!(path.exists());
    }

    #[test]
    fn single_device_amount() {
        let library = Library::new(
            LibraryConfig::default()
                .with_device_amount(DeviceAmount::One)
                .with_workers_count(2),
        )
        .unwrap();
        assert_eq!(library.device_count(), 1);
    }
}
