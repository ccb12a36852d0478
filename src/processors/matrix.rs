//! Processors for matrix-destination operations and matrix egress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::block::MatrixBlock;
use crate::descriptor::Param;
use crate::error::{Error, Result};
use crate::expression::{NodeData, NodeOp};
use crate::grid::{self, BlockCoord, Index};
use crate::ops;
use crate::primitives;
use crate::registry::{
    AlgoKind, AlgoParams, ParamsMatrixEwise, ParamsMatrixReduce, ParamsTranspose, ParamsTria,
};
use crate::storage::StorageRef;
use crate::types::Value;

use super::{
    effective_accum, emit_matrix_destination, matrix_mask_at, ComputeMask, ExecCtx,
    NodeProcessor, SubtaskBuilder,
};

// ---------------------------------------------------------------------------
// Element-wise add / mult
// ---------------------------------------------------------------------------

pub(crate) struct MatrixEwiseProcessor;

impl NodeProcessor for MatrixEwiseProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let (w, mask, a, b) = match &node.op {
            NodeOp::MatrixEWiseAdd { w, mask, a, b, .. }
            | NodeOp::MatrixEWiseMult { w, mask, a, b, .. } => (w, mask, a, b),
            _ => return Vec::new(),
        };
        let mut out = vec![
            (w.storage_ref(), true),
            (a.storage_ref(), false),
            (b.storage_ref(), false),
        ];
        if let Some(m) = mask {
            out.push((m.storage_ref(), false));
        }
        out
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let (w, mask, op, a, b, kind, label) = match &node.op {
            NodeOp::MatrixEWiseAdd { w, mask, op, a, b } => {
                (w, mask, op, a, b, AlgoKind::MatrixEWiseAdd, "matrix_ewise_add")
            }
            NodeOp::MatrixEWiseMult { w, mask, op, a, b } => {
                (w, mask, op, a, b, AlgoKind::MatrixEWiseMult, "matrix_ewise_mult")
            }
            _ => return Err(Error::invalid_state("matrix ewise node expected")),
        };
        let accum = effective_accum(None, &ctx.eff, w.element_type());
        let env = ctx.env.clone();
        let eff = ctx.eff.clone();
        let ty = w.element_type().clone();
        let op = op.clone();
        let a_s = a.storage().clone();
        let b_s = b.storage().clone();
        let mask_s = mask.as_ref().map(|m| m.storage().clone());
        let dispatch_env = env.clone();

        emit_matrix_destination(
            &env,
            builder,
            &ctx.eff,
            label,
            w,
            mask,
            accum,
            move |coord, nrows, ncols, device_id| {
                let mask_param = match matrix_mask_at(&mask_s, coord, &eff)? {
                    ComputeMask::Skip => return Ok(None),
                    ComputeMask::Open => None,
                    ComputeMask::Apply(block, complement) => Some((block, complement)),
                };
                let mut params = AlgoParams::MatrixEwise(ParamsMatrixEwise {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    op: op.clone(),
                    mask: mask_param,
                    nrows,
                    ncols,
                    a: a_s.get_block(coord),
                    b: b_s.get_block(coord),
                    out: None,
                });
                dispatch_env.dispatch(device_id, kind, &mut params)?;
                let AlgoParams::MatrixEwise(p) = params else {
                    return Err(Error::invalid_state("matrix ewise params expected"));
                };
                Ok(p.out)
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Reduce to scalar
// ---------------------------------------------------------------------------

pub(crate) struct MatrixReduceProcessor;

impl NodeProcessor for MatrixReduceProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::MatrixReduceScalar { s, m, mask, .. } = &node.op else {
            return Vec::new();
        };
        let mut out = vec![(s.storage_ref(), true), (m.storage_ref(), false)];
        if let Some(mk) = mask {
            out.push((mk.storage_ref(), false));
        }
        out
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::MatrixReduceScalar { s, op, m, mask } = &node.op else {
            return Err(Error::invalid_state("matrix reduce node expected"));
        };
        let m_s = m.storage().clone();
        let (rows, cols) = (m_s.nblock_rows(), m_s.nblock_cols());
        let nblocks = rows * cols;
        let device_ids = ctx.env.devices.fetch_devices(nblocks, &ctx.eff)?;
        let partials: Arc<Mutex<Vec<Option<Value>>>> =
            Arc::new(Mutex::new(vec![None; nblocks]));

        let mut partial_tasks = Vec::with_capacity(nblocks);
        for i in 0..rows {
            for j in 0..cols {
                let coord = BlockCoord::new(i, j);
                let slot = i * cols + j;
                let env = ctx.env.clone();
                let eff = ctx.eff.clone();
                let ty = m.element_type().clone();
                let op = op.clone();
                let m_s = m_s.clone();
                let mask_s = mask.as_ref().map(|mk| mk.storage().clone());
                let partials = partials.clone();
                let device_id = device_ids[slot];
                let task = builder.emit(format!("matrix_reduce:block({i},{j})"), move || {
                    let Some(block) = m_s.get_block(coord) else {
                        return Ok(());
                    };
                    let mask_param = match matrix_mask_at(&mask_s, coord, &eff)? {
                        ComputeMask::Skip => return Ok(()),
                        ComputeMask::Open => None,
                        ComputeMask::Apply(mb, complement) => Some((mb, complement)),
                    };
                    let mut params = AlgoParams::MatrixReduce(ParamsMatrixReduce {
                        desc: eff.clone(),
                        device_id,
                        ty,
                        op,
                        mask: mask_param,
                        block,
                        out: None,
                    });
                    env.dispatch(device_id, AlgoKind::MatrixReduceScalar, &mut params)?;
                    let AlgoParams::MatrixReduce(p) = params else {
                        return Err(Error::invalid_state("matrix reduce params expected"));
                    };
                    partials.lock().expect("reduce partials poisoned")[slot] = p.out;
                    Ok(())
                });
                partial_tasks.push(task);
            }
        }

        let op = op.clone();
        let eff = ctx.eff.clone();
        let scalar = s.storage().clone();
        let fold = builder.emit("matrix_reduce:fold", move || {
            let partials = partials.lock().expect("reduce partials poisoned");
            let mut acc: Option<Value> = None;
            for part in partials.iter().flatten() {
                acc = Some(match acc {
                    None => part.clone(),
                    Some(a) => op.apply(&a, part)?,
                });
            }
            if eff.is_param_set(Param::AccumResult) {
                if let (Some(old), Some(new)) = (scalar.get(), acc.clone()) {
                    acc = Some(op.apply(&old, &new)?);
                }
            }
            scalar.set(acc);
            Ok(())
        });
        for task in partial_tasks {
            builder.precede(task, fold);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transpose
// ---------------------------------------------------------------------------

pub(crate) struct TransposeProcessor;

impl NodeProcessor for TransposeProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::Transpose { w, mask, a, .. } = &node.op else {
            return Vec::new();
        };
        let mut out = vec![(w.storage_ref(), true), (a.storage_ref(), false)];
        if let Some(m) = mask {
            out.push((m.storage_ref(), false));
        }
        out
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::Transpose { w, mask, a, accum } = &node.op else {
            return Err(Error::invalid_state("transpose node expected"));
        };
        let accum = effective_accum(accum.clone(), &ctx.eff, w.element_type());
        let env = ctx.env.clone();
        let eff = ctx.eff.clone();
        let ty = w.element_type().clone();
        let a_s = a.storage().clone();
        let mask_s = mask.as_ref().map(|m| m.storage().clone());
        let dispatch_env = env.clone();

        emit_matrix_destination(
            &env,
            builder,
            &ctx.eff,
            "transpose",
            w,
            mask,
            accum,
            move |coord, _nrows, _ncols, device_id| {
                // Destination (i, j) reads source block (j, i).
                let Some(src) = a_s.get_block(coord.transposed()) else {
                    return Ok(None);
                };
                let mask_param = match matrix_mask_at(&mask_s, coord, &eff)? {
                    ComputeMask::Skip => return Ok(None),
                    ComputeMask::Open => None,
                    ComputeMask::Apply(block, complement) => Some((block, complement)),
                };
                let mut params = AlgoParams::Transpose(ParamsTranspose {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    mask: mask_param,
                    a: src,
                    out: None,
                });
                dispatch_env.dispatch(device_id, AlgoKind::Transpose, &mut params)?;
                let AlgoParams::Transpose(p) = params else {
                    return Err(Error::invalid_state("transpose params expected"));
                };
                Ok(p.out)
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Triangular extraction
// ---------------------------------------------------------------------------

pub(crate) struct TriaProcessor;

impl NodeProcessor for TriaProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let (w, a) = match &node.op {
            NodeOp::Tril { w, a } | NodeOp::Triu { w, a } => (w, a),
            _ => return Vec::new(),
        };
        vec![(w.storage_ref(), true), (a.storage_ref(), false)]
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let (w, a, lower, label) = match &node.op {
            NodeOp::Tril { w, a } => (w, a, true, "tril"),
            NodeOp::Triu { w, a } => (w, a, false, "triu"),
            _ => return Err(Error::invalid_state("tria node expected")),
        };
        let env = ctx.env.clone();
        let eff = ctx.eff.clone();
        let ty = w.element_type().clone();
        let a_s = a.storage().clone();
        let block_size = a_s.block_size();
        let dispatch_env = env.clone();

        emit_matrix_destination(
            &env,
            builder,
            &ctx.eff,
            label,
            w,
            &None,
            None,
            move |coord, _nrows, _ncols, device_id| {
                let Some(src) = a_s.get_block(coord) else {
                    return Ok(None);
                };
                let mut params = AlgoParams::Tria(ParamsTria {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    lower,
                    row_base: (coord.row * block_size) as u64,
                    col_base: (coord.col * block_size) as u64,
                    a: src,
                    out: None,
                });
                dispatch_env.dispatch(device_id, AlgoKind::Tria, &mut params)?;
                let AlgoParams::Tria(p) = params else {
                    return Err(Error::invalid_state("tria params expected"));
                };
                Ok(p.out)
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Bulk ingress
// ---------------------------------------------------------------------------

pub(crate) struct MatrixDataWriteProcessor;

impl NodeProcessor for MatrixDataWriteProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::MatrixDataWrite { m, .. } = &node.op else {
            return Vec::new();
        };
        vec![(m.storage_ref(), true)]
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::MatrixDataWrite { m, data } = &node.op else {
            return Err(Error::invalid_state("matrix data-write node expected"));
        };
        let storage = m.storage().clone();
        let ty = m.element_type().clone();
        let accum = ctx.eff.is_param_set(Param::AccumResult);
        let (brows, bcols) = (storage.nblock_rows(), storage.nblock_cols());
        let nblocks = brows * bcols;
        let device_ids = ctx.env.devices.fetch_devices(nblocks, &ctx.eff)?;
        type Partition = HashMap<BlockCoord, (Vec<Index>, Vec<Index>, Vec<Value>)>;
        let partition: Arc<Mutex<Partition>> = Arc::new(Mutex::new(HashMap::new()));

        let prep = {
            let data = data.clone();
            let partition = partition.clone();
            let eff = ctx.eff.clone();
            let ty = ty.clone();
            let storage = storage.clone();
            builder.emit("matrix_data_write:prepare", move || {
                let mut rows = data.rows();
                let mut cols = data.cols();
                let mut values = if ty.has_values() { data.values() } else { Vec::new() };
                if ty.has_values() && !rows.is_empty() && values.len() != rows.len() {
                    return Err(Error::invalid_argument(
                        "value buffer does not cover all entries",
                    ));
                }
                let (nrows, ncols) = (storage.nrows(), storage.ncols());
                if let Some(&bad) = rows.iter().find(|&&r| r as usize >= nrows) {
                    return Err(Error::invalid_argument(format!(
                        "row index {bad} out of range (nrows={nrows})"
                    )));
                }
                if let Some(&bad) = cols.iter().find(|&&c| c as usize >= ncols) {
                    return Err(Error::invalid_argument(format!(
                        "col index {bad} out of range (ncols={ncols})"
                    )));
                }
                for value in &values {
                    value.check_type(&ty)?;
                }
                if !eff.is_param_set(Param::ValuesSorted) {
                    primitives::sort_by_row_col(&mut rows, &mut cols, &mut values);
                }
                if !eff.is_param_set(Param::NoDuplicates) {
                    let reducer = ops::keep_first(&ty);
                    let (r, c, v) =
                        primitives::reduce_duplicates_rc(&rows, &cols, &values, &reducer)?;
                    rows = r;
                    cols = c;
                    values = v;
                }
                let block_size = storage.block_size();
                let mut map: Partition = HashMap::new();
                for k in 0..rows.len() {
                    let coord = BlockCoord::new(
                        rows[k] as usize / block_size,
                        cols[k] as usize / block_size,
                    );
                    let slot = map.entry(coord).or_default();
                    slot.0.push(rows[k] - (coord.row * block_size) as Index);
                    slot.1.push(cols[k] - (coord.col * block_size) as Index);
                    if !values.is_empty() {
                        slot.2.push(values[k].clone());
                    }
                }
                *partition.lock().expect("ingress partition poisoned") = map;
                Ok(())
            })
        };

        let clear = if accum {
            None
        } else {
            let s = storage.clone();
            Some(builder.emit("matrix_data_write:clear", move || {
                s.clear();
                Ok(())
            }))
        };

        for i in 0..brows {
            for j in 0..bcols {
                let coord = BlockCoord::new(i, j);
                let nrows = grid::block_dim(i, storage.nrows(), storage.block_size())?;
                let ncols = grid::block_dim(j, storage.ncols(), storage.block_size())?;
                let device_id = device_ids[i * bcols + j];
                let env = ctx.env.clone();
                let eff = ctx.eff.clone();
                let ty = ty.clone();
                let storage = storage.clone();
                let partition = partition.clone();
                let task = builder.emit(format!("matrix_data_write:block({i},{j})"), move || {
                    let chunk = partition
                        .lock()
                        .expect("ingress partition poisoned")
                        .remove(&coord);
                    let Some((rows, cols, values)) = chunk else {
                        return Ok(());
                    };
                    let fresh = Arc::new(MatrixBlock::coo(nrows, ncols, rows, cols, values));
                    if accum {
                        let mut params = AlgoParams::MatrixEwise(ParamsMatrixEwise {
                            desc: eff.clone(),
                            device_id,
                            ty: ty.clone(),
                            op: ops::default_accum(&ty),
                            mask: None,
                            nrows,
                            ncols,
                            a: storage.get_block(coord),
                            b: Some(fresh),
                            out: None,
                        });
                        env.dispatch(device_id, AlgoKind::MatrixEWiseAdd, &mut params)?;
                        let AlgoParams::MatrixEwise(p) = params else {
                            return Err(Error::invalid_state("matrix ewise params expected"));
                        };
                        storage.set_block(coord, p.out);
                    } else {
                        storage.set_block(coord, Some(fresh));
                    }
                    Ok(())
                });
                builder.precede(prep, task);
                if let Some(clear) = clear {
                    builder.precede(clear, task);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bulk egress
// ---------------------------------------------------------------------------

pub(crate) struct MatrixDataReadProcessor;

impl NodeProcessor for MatrixDataReadProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::MatrixDataRead { m, .. } = &node.op else {
            return Vec::new();
        };
        vec![(m.storage_ref(), false)]
    }

    fn execute(
        &self,
        _ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::MatrixDataRead { m, data } = &node.op else {
            return Err(Error::invalid_state("matrix data-read node expected"));
        };
        let storage = m.storage().clone();
        let ty = m.element_type().clone();
        let (brows, bcols) = (storage.nblock_rows(), storage.nblock_cols());

        // 1. Per-block nnz; 2. per-row-of-blocks offsets; 3. per-block-row
        // merge scatter in global (row, col) order; 4. store.
        let counts: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; brows * bcols]));
        let offsets: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        type OutBufs = (Vec<Index>, Vec<Index>, Vec<Value>);
        let out: Arc<Mutex<OutBufs>> = Arc::new(Mutex::new((Vec::new(), Vec::new(), Vec::new())));

        let mut count_tasks = Vec::with_capacity(brows * bcols);
        for i in 0..brows {
            for j in 0..bcols {
                let coord = BlockCoord::new(i, j);
                let slot = i * bcols + j;
                let storage = storage.clone();
                let counts = counts.clone();
                let task = builder.emit(format!("matrix_data_read:nnz({i},{j})"), move || {
                    let n = storage.get_block(coord).map(|b| b.nvals()).unwrap_or(0);
                    counts.lock().expect("egress counts poisoned")[slot] = n;
                    Ok(())
                });
                count_tasks.push(task);
            }
        }

        let offsets_task = {
            let counts = counts.clone();
            let offsets = offsets.clone();
            let out = out.clone();
            let data = data.clone();
            let ty = ty.clone();
            builder.emit("matrix_data_read:offsets", move || {
                let counts = counts.lock().expect("egress counts poisoned");
                // Offsets per row of blocks.
                let per_row: Vec<usize> = (0..brows)
                    .map(|i| counts[i * bcols..(i + 1) * bcols].iter().sum())
                    .collect();
                let scan = primitives::exclusive_scan(&per_row);
                let total = *scan.last().unwrap_or(&0);
                if data.capacity() < total {
                    return Err(Error::invalid_argument(format!(
                        "data buffers hold {} entries but the matrix has {total}",
                        data.capacity()
                    )));
                }
                let mut bufs = out.lock().expect("egress buffers poisoned");
                bufs.0 = vec![0; total];
                bufs.1 = vec![0; total];
                bufs.2 = if ty.has_values() {
                    vec![Value::zero_of(&ty); total]
                } else {
                    Vec::new()
                };
                *offsets.lock().expect("egress offsets poisoned") = scan;
                Ok(())
            })
        };
        for task in &count_tasks {
            builder.precede(*task, offsets_task);
        }

        let mut scatter_tasks = Vec::with_capacity(brows);
        for i in 0..brows {
            let storage = storage.clone();
            let offsets = offsets.clone();
            let out = out.clone();
            let task = builder.emit(format!("matrix_data_read:scatter_row{i}"), move || {
                let block_size = storage.block_size();
                let row_base = (i * block_size) as Index;
                // Gather this block-row's blocks with globalized columns.
                let mut sources: Vec<(Vec<Index>, Vec<Index>, Vec<Value>, usize)> = Vec::new();
                for j in 0..bcols {
                    let Some(block) = storage.get_block(BlockCoord::new(i, j)) else {
                        continue;
                    };
                    let col_base = (j * block_size) as Index;
                    let (rows, mut cols, values) = primitives::matrix_entries(&block);
                    for c in &mut cols {
                        *c += col_base;
                    }
                    sources.push((rows, cols, values, 0));
                }
                let start = offsets.lock().expect("egress offsets poisoned")[i];
                let mut bufs = out.lock().expect("egress buffers poisoned");
                let mut pos = start;
                // K-way merge by (row, col); each source is already sorted.
                loop {
                    let mut best: Option<usize> = None;
                    for (k, (rows, cols, _, cursor)) in sources.iter().enumerate() {
                        if *cursor >= rows.len() {
                            continue;
                        }
                        let key = ((rows[*cursor] as u64) << 32) | cols[*cursor] as u64;
                        let better = match best {
                            None => true,
                            Some(b) => {
                                let (brs, bcs, _, bc) = &sources[b];
                                key < (((brs[*bc] as u64) << 32) | bcs[*bc] as u64)
                            }
                        };
                        if better {
                            best = Some(k);
                        }
                    }
                    let Some(k) = best else { break };
                    let (rows, cols, values, cursor) = &mut sources[k];
                    bufs.0[pos] = row_base + rows[*cursor];
                    bufs.1[pos] = cols[*cursor];
                    if !bufs.2.is_empty() {
                        bufs.2[pos] = values[*cursor].clone();
                    }
                    *cursor += 1;
                    pos += 1;
                }
                Ok(())
            });
            builder.precede(offsets_task, task);
            scatter_tasks.push(task);
        }

        let data = data.clone();
        let store = builder.emit("matrix_data_read:store", move || {
            let mut bufs = out.lock().expect("egress buffers poisoned");
            let rows = std::mem::take(&mut bufs.0);
            let cols = std::mem::take(&mut bufs.1);
            let values = std::mem::take(&mut bufs.2);
            data.store(rows, cols, values)
        });
        for task in scatter_tasks {
            builder.precede(task, store);
        }
        Ok(())
    }
}
