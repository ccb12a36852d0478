//! Node processors: translate one expression node into per-block tasks.
//!
//! Every operation has one processor with three phases: `prepare` records
//! read/write lock intents for each storage the node will touch, `execute`
//! emits the per-block tasks between the node's bookend fences, and
//! `finalize` runs after the graph drains (the scheduler owns the actual
//! lock release, so finalize is bookkeeping only).
//!
//! Common rules implemented here once:
//! - `AccumResult` without an explicit accumulator synthesises the
//!   right-biased `second` operator.
//! - Without accumulation the destination storage is cleared by an extra
//!   task that precedes all compute tasks.
//! - A regular mask with an absent block short-circuits the task; a
//!   complement mask with an absent block means fully unmasked; a
//!   complement flag without any mask fails with `InvalidState`.

use std::sync::Arc;

use crate::descriptor::{Descriptor, Param};
use crate::devices::{CommandQueue, DeviceId, DeviceManager};
use crate::error::{Error, Result};
use crate::expression::{NodeData, NodeOp};
use crate::grid::{self, BlockCoord};
use crate::ops::{self, BinaryOp};
use crate::pool::{ExecShared, GraphBuilder, TaskId};
use crate::primitives;
use crate::registry::{
    AlgoKind, AlgoParams, AlgorithmRegistry, ParamsMatrixEwise, ParamsVectorEwise,
};
use crate::storage::{MatrixStorage, StorageRef, VectorStorage};
use crate::tensor::{Matrix, Vector};
use crate::block::{MatrixBlock, VectorBlock};
use crate::types::Type;

mod matrix;
mod multiply;
mod vector;

/// Engine internals every task can reach.
pub(crate) struct EngineEnv {
    pub devices: DeviceManager,
    pub registry: AlgorithmRegistry,
}

impl EngineEnv {
    /// Run one algorithm dispatch on the chosen device, through a per-task
    /// command queue finished before returning.
    pub fn dispatch(
        &self,
        device_id: DeviceId,
        kind: AlgoKind,
        params: &mut AlgoParams,
    ) -> Result<()> {
        let device = self.devices.device(device_id);
        let mut queue = CommandQueue::new(device);
        queue.enqueue(kind.as_str());
        let result = self.registry.dispatch(kind, params);
        queue.finish();
        result
    }
}

/// Per-node execution context handed to `execute`.
pub(crate) struct ExecCtx {
    pub env: Arc<EngineEnv>,
    /// Node descriptor over expression descriptor over library defaults.
    pub eff: Descriptor,
}

/// Emits tasks between one node's bookend fences.
pub(crate) struct SubtaskBuilder<'a> {
    graph: &'a mut GraphBuilder,
    start: TaskId,
    end: TaskId,
    exec: Arc<ExecShared>,
    profile: bool,
}

impl<'a> SubtaskBuilder<'a> {
    pub(crate) fn new(
        graph: &'a mut GraphBuilder,
        start: TaskId,
        end: TaskId,
        exec: Arc<ExecShared>,
        profile: bool,
    ) -> Self {
        Self {
            graph,
            start,
            end,
            exec,
            profile,
        }
    }

    /// Emit a task; cancelled expressions skip the work.
    pub fn emit(
        &mut self,
        label: impl Into<String>,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> TaskId {
        let exec = self.exec.clone();
        let action: crate::pool::TaskAction = Box::new(move || {
            if exec.cancelled() {
                return Ok(());
            }
            f()
        });
        let id = self.graph.add_task(label, self.profile, Some(action));
        self.graph.precede(self.start, id);
        self.graph.precede(id, self.end);
        id
    }

    /// Chain two emitted tasks.
    pub fn precede(&mut self, before: TaskId, after: TaskId) {
        self.graph.precede(before, after);
    }
}

/// One processor per operation kind.
pub(crate) trait NodeProcessor: Sync {
    /// Storages the node touches, with the write flag.
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)>;

    /// Emit per-block tasks. No computation happens here; the emitted
    /// closures read block content only when they run.
    fn execute(&self, ctx: &ExecCtx, node: &NodeData, builder: &mut SubtaskBuilder<'_>)
        -> Result<()>;

    /// Post-drain hook; lock release is owned by the scheduler.
    fn finalize(&self, _node: &NodeData) {}
}

/// Select the processor for an operation.
pub(crate) fn processor_for(op: &NodeOp) -> &'static dyn NodeProcessor {
    match op {
        NodeOp::VectorDataWrite { .. } => &vector::VectorDataWriteProcessor,
        NodeOp::VectorDataRead { .. } => &vector::VectorDataReadProcessor,
        NodeOp::VectorEWiseAdd { .. } | NodeOp::VectorEWiseMult { .. } => {
            &vector::VectorEwiseProcessor
        }
        NodeOp::VectorAssign { .. } => &vector::VectorAssignProcessor,
        NodeOp::VectorReduce { .. } => &vector::VectorReduceProcessor,
        NodeOp::VectorToDense { .. } => &vector::VectorToDenseProcessor,
        NodeOp::MatrixDataWrite { .. } => &matrix::MatrixDataWriteProcessor,
        NodeOp::MatrixDataRead { .. } => &matrix::MatrixDataReadProcessor,
        NodeOp::MatrixEWiseAdd { .. } | NodeOp::MatrixEWiseMult { .. } => {
            &matrix::MatrixEwiseProcessor
        }
        NodeOp::MatrixReduceScalar { .. } => &matrix::MatrixReduceProcessor,
        NodeOp::Transpose { .. } => &matrix::TransposeProcessor,
        NodeOp::Tril { .. } | NodeOp::Triu { .. } => &matrix::TriaProcessor,
        NodeOp::MxM { .. } => &multiply::MxMProcessor,
        NodeOp::MxV { .. } => &multiply::MxVProcessor,
        NodeOp::VxM { .. } => &multiply::VxMProcessor,
    }
}

// ---------------------------------------------------------------------------
// Shared rules
// ---------------------------------------------------------------------------

/// The effective accumulator: explicit operator, or the synthesised
/// right-biased default when only the flag is set.
pub(crate) fn effective_accum(
    explicit: Option<Arc<BinaryOp>>,
    eff: &Descriptor,
    ty: &Arc<Type>,
) -> Option<Arc<BinaryOp>> {
    if let Some(op) = explicit {
        return Some(op);
    }
    if eff.is_param_set(Param::AccumResult) {
        return Some(ops::default_accum(ty));
    }
    None
}

/// Mask resolution for one task.
pub(crate) enum ComputeMask<B> {
    /// No filtering applies.
    Open,
    /// Produce nothing for this block.
    Skip,
    /// Filter through this block; the flag is the complement bit.
    Apply(Arc<B>, bool),
}

pub(crate) fn vector_mask_at(
    mask: &Option<Arc<VectorStorage>>,
    index: usize,
    eff: &Descriptor,
) -> Result<ComputeMask<VectorBlock>> {
    let complement = eff.is_param_set(Param::MaskComplement);
    match mask {
        None => {
            if complement {
                Err(Error::invalid_state(
                    "MaskComplement requires a mask argument",
                ))
            } else {
                Ok(ComputeMask::Open)
            }
        }
        Some(storage) => match storage.get_block(index) {
            Some(block) => Ok(ComputeMask::Apply(block, complement)),
            None if complement => Ok(ComputeMask::Open),
            None => Ok(ComputeMask::Skip),
        },
    }
}

pub(crate) fn matrix_mask_at(
    mask: &Option<Arc<MatrixStorage>>,
    coord: BlockCoord,
    eff: &Descriptor,
) -> Result<ComputeMask<MatrixBlock>> {
    let complement = eff.is_param_set(Param::MaskComplement);
    match mask {
        None => {
            if complement {
                Err(Error::invalid_state(
                    "MaskComplement requires a mask argument",
                ))
            } else {
                Ok(ComputeMask::Open)
            }
        }
        Some(storage) => match storage.get_block(coord) {
            Some(block) => Ok(ComputeMask::Apply(block, complement)),
            None if complement => Ok(ComputeMask::Open),
            None => Ok(ComputeMask::Skip),
        },
    }
}

// ---------------------------------------------------------------------------
// Destination wiring: clear-or-accumulate around per-block computes
// ---------------------------------------------------------------------------

/// Wire per-block compute tasks into a vector destination.
///
/// Without accumulation a clearing task precedes every compute and results
/// land directly in `w`. With accumulation computes land in a scratch
/// storage and a chained accumulate task merges each scratch block into the
/// destination, honouring `Replace` for masked updates.
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_vector_destination<F>(
    env: &Arc<EngineEnv>,
    builder: &mut SubtaskBuilder<'_>,
    eff: &Descriptor,
    label: &str,
    w: &Vector,
    mask: &Option<Vector>,
    accum: Option<Arc<BinaryOp>>,
    compute: F,
) -> Result<()>
where
    F: Fn(usize, usize, DeviceId) -> Result<Option<Arc<VectorBlock>>> + Send + Sync + 'static,
{
    let storage = w.storage().clone();
    let nblocks = storage.nblock_rows();
    let device_ids = env.devices.fetch_devices(nblocks, eff)?;
    let compute = Arc::new(compute);
    let ty = w.element_type().clone();
    let mask_storage = mask.as_ref().map(|m| m.storage().clone());

    let clear_task = match accum {
        None => {
            let s = storage.clone();
            Some(builder.emit(format!("{label}:clear"), move || {
                s.clear();
                Ok(())
            }))
        }
        Some(_) => None,
    };
    let scratch = match accum {
        Some(_) => Some(VectorStorage::new(storage.nrows(), storage.block_size())?),
        None => None,
    };

    for i in 0..nblocks {
        let dim = grid::block_dim(i, storage.nrows(), storage.block_size())?;
        let device_id = device_ids[i];
        match (&accum, &scratch) {
            (None, _) => {
                let s = storage.clone();
                let compute = compute.clone();
                let task = builder.emit(format!("{label}:block{i}"), move || {
                    let out = compute(i, dim, device_id)?;
                    s.set_block(i, out);
                    Ok(())
                });
                if let Some(clear) = clear_task {
                    builder.precede(clear, task);
                }
            }
            (Some(accum_op), Some(scratch)) => {
                let scratch_in = scratch.clone();
                let compute = compute.clone();
                let compute_task = builder.emit(format!("{label}:block{i}"), move || {
                    let out = compute(i, dim, device_id)?;
                    scratch_in.set_block(i, out);
                    Ok(())
                });

                let env = env.clone();
                let s = storage.clone();
                let scratch_out = scratch.clone();
                let accum_op = accum_op.clone();
                let eff = eff.clone();
                let ty = ty.clone();
                let mask_storage = mask_storage.clone();
                let accum_task = builder.emit(format!("{label}:accum{i}"), move || {
                    let Some(fresh) = scratch_out.get_block(i) else {
                        return Ok(());
                    };
                    let old = replace_filtered_vector(
                        s.get_block(i),
                        &mask_storage,
                        i,
                        &eff,
                    );
                    let mut params = AlgoParams::VectorEwise(ParamsVectorEwise {
                        desc: eff.clone(),
                        device_id,
                        ty: ty.clone(),
                        op: accum_op.clone(),
                        mask: None,
                        size: dim,
                        a: old,
                        b: Some(fresh),
                        out: None,
                    });
                    env.dispatch(device_id, AlgoKind::VectorEWiseAdd, &mut params)?;
                    let AlgoParams::VectorEwise(p) = params else {
                        return Err(Error::invalid_state("vector ewise params expected"));
                    };
                    s.set_block(i, p.out);
                    Ok(())
                });
                builder.precede(compute_task, accum_task);
            }
            _ => {}
        }
    }
    Ok(())
}

/// `Replace` under a mask drops destination entries outside the mask before
/// the accumulate merge.
fn replace_filtered_vector(
    old: Option<Arc<VectorBlock>>,
    mask: &Option<Arc<VectorStorage>>,
    index: usize,
    eff: &Descriptor,
) -> Option<Arc<VectorBlock>> {
    let old_block = old?;
    if !eff.is_param_set(Param::Replace) {
        return Some(old_block);
    }
    let Some(mask_storage) = mask else {
        return Some(old_block);
    };
    let complement = eff.is_param_set(Param::MaskComplement);
    match mask_storage.get_block(index) {
        Some(mask_block) => {
            let (rows, values) = primitives::vector_entries(&old_block);
            let (rows, values) =
                primitives::vector_apply_mask(&rows, &values, &mask_block, complement);
            if rows.is_empty() {
                None
            } else {
                Some(Arc::new(VectorBlock::coo(old_block.nrows(), rows, values)))
            }
        }
        // Absent regular mask block masks everything out; absent
        // complement block keeps everything.
        None if complement => Some(old_block),
        None => None,
    }
}

/// Matrix counterpart of [`emit_vector_destination`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_matrix_destination<F>(
    env: &Arc<EngineEnv>,
    builder: &mut SubtaskBuilder<'_>,
    eff: &Descriptor,
    label: &str,
    w: &Matrix,
    mask: &Option<Matrix>,
    accum: Option<Arc<BinaryOp>>,
    compute: F,
) -> Result<()>
where
    F: Fn(BlockCoord, usize, usize, DeviceId) -> Result<Option<Arc<MatrixBlock>>>
        + Send
        + Sync
        + 'static,
{
    let storage = w.storage().clone();
    let (rows, cols) = (storage.nblock_rows(), storage.nblock_cols());
    let device_ids = env.devices.fetch_devices(rows * cols, eff)?;
    let compute = Arc::new(compute);
    let ty = w.element_type().clone();
    let mask_storage = mask.as_ref().map(|m| m.storage().clone());

    let clear_task = match accum {
        None => {
            let s = storage.clone();
            Some(builder.emit(format!("{label}:clear"), move || {
                s.clear();
                Ok(())
            }))
        }
        Some(_) => None,
    };
    let scratch = match accum {
        Some(_) => Some(MatrixStorage::new(
            storage.nrows(),
            storage.ncols(),
            storage.block_size(),
        )?),
        None => None,
    };

    for i in 0..rows {
        for j in 0..cols {
            let coord = BlockCoord::new(i, j);
            let nrows = grid::block_dim(i, storage.nrows(), storage.block_size())?;
            let ncols = grid::block_dim(j, storage.ncols(), storage.block_size())?;
            let device_id = device_ids[i * cols + j];
            match (&accum, &scratch) {
                (None, _) => {
                    let s = storage.clone();
                    let compute = compute.clone();
                    let task = builder.emit(format!("{label}:block({i},{j})"), move || {
                        let out = compute(coord, nrows, ncols, device_id)?;
                        s.set_block(coord, out);
                        Ok(())
                    });
                    if let Some(clear) = clear_task {
                        builder.precede(clear, task);
                    }
                }
                (Some(accum_op), Some(scratch)) => {
                    let scratch_in = scratch.clone();
                    let compute = compute.clone();
                    let compute_task =
                        builder.emit(format!("{label}:block({i},{j})"), move || {
                            let out = compute(coord, nrows, ncols, device_id)?;
                            scratch_in.set_block(coord, out);
                            Ok(())
                        });

                    let env = env.clone();
                    let s = storage.clone();
                    let scratch_out = scratch.clone();
                    let accum_op = accum_op.clone();
                    let eff = eff.clone();
                    let ty = ty.clone();
                    let mask_storage = mask_storage.clone();
                    let accum_task = builder.emit(format!("{label}:accum({i},{j})"), move || {
                        let Some(fresh) = scratch_out.get_block(coord) else {
                            return Ok(());
                        };
                        let old = replace_filtered_matrix(
                            s.get_block(coord),
                            &mask_storage,
                            coord,
                            &eff,
                        );
                        let mut params = AlgoParams::MatrixEwise(ParamsMatrixEwise {
                            desc: eff.clone(),
                            device_id,
                            ty: ty.clone(),
                            op: accum_op.clone(),
                            mask: None,
                            nrows,
                            ncols,
                            a: old,
                            b: Some(fresh),
                            out: None,
                        });
                        env.dispatch(device_id, AlgoKind::MatrixEWiseAdd, &mut params)?;
                        let AlgoParams::MatrixEwise(p) = params else {
                            return Err(Error::invalid_state("matrix ewise params expected"));
                        };
                        s.set_block(coord, p.out);
                        Ok(())
                    });
                    builder.precede(compute_task, accum_task);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn replace_filtered_matrix(
    old: Option<Arc<MatrixBlock>>,
    mask: &Option<Arc<MatrixStorage>>,
    coord: BlockCoord,
    eff: &Descriptor,
) -> Option<Arc<MatrixBlock>> {
    let old_block = old?;
    if !eff.is_param_set(Param::Replace) {
        return Some(old_block);
    }
    let Some(mask_storage) = mask else {
        return Some(old_block);
    };
    let complement = eff.is_param_set(Param::MaskComplement);
    match mask_storage.get_block(coord) {
        Some(mask_block) => {
            let (rows, cols, values) = primitives::matrix_entries(&old_block);
            let (rows, cols, values) =
                primitives::matrix_apply_mask(&rows, &cols, &values, &mask_block, complement);
            if rows.is_empty() {
                None
            } else {
                Some(Arc::new(MatrixBlock::coo(
                    old_block.nrows(),
                    old_block.ncols(),
                    rows,
                    cols,
                    values,
                )))
            }
        }
        None if complement => Some(old_block),
        None => None,
    }
}
