//! Processors for vector-destination operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::block::VectorBlock;
use crate::descriptor::Param;
use crate::error::{Error, Result};
use crate::expression::{NodeData, NodeOp};
use crate::grid::{self, Index};
use crate::ops;
use crate::primitives;
use crate::registry::{
    AlgoKind, AlgoParams, ParamsVectorAssign, ParamsVectorEwise, ParamsVectorReduce,
    ParamsVectorToDense,
};
use crate::storage::StorageRef;
use crate::types::Value;

use super::{
    effective_accum, emit_vector_destination, vector_mask_at, ComputeMask, ExecCtx,
    NodeProcessor, SubtaskBuilder,
};

// ---------------------------------------------------------------------------
// Element-wise add / mult
// ---------------------------------------------------------------------------

pub(crate) struct VectorEwiseProcessor;

impl NodeProcessor for VectorEwiseProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let (w, mask, a, b) = match &node.op {
            NodeOp::VectorEWiseAdd { w, mask, a, b, .. }
            | NodeOp::VectorEWiseMult { w, mask, a, b, .. } => (w, mask, a, b),
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
            NodeOp::VectorEWiseAdd { w, mask, op, a, b } => {
                (w, mask, op, a, b, AlgoKind::VectorEWiseAdd, "vector_ewise_add")
            }
            NodeOp::VectorEWiseMult { w, mask, op, a, b } => {
                (w, mask, op, a, b, AlgoKind::VectorEWiseMult, "vector_ewise_mult")
            }
            _ => return Err(Error::invalid_state("vector ewise node expected")),
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

        emit_vector_destination(
            &env,
            builder,
            &ctx.eff,
            label,
            w,
            mask,
            accum,
            move |i, dim, device_id| {
                let mask_param = match vector_mask_at(&mask_s, i, &eff)? {
                    ComputeMask::Skip => return Ok(None),
                    ComputeMask::Open => None,
                    ComputeMask::Apply(block, complement) => Some((block, complement)),
                };
                let mut params = AlgoParams::VectorEwise(ParamsVectorEwise {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    op: op.clone(),
                    mask: mask_param,
                    size: dim,
                    a: a_s.get_block(i),
                    b: b_s.get_block(i),
                    out: None,
                });
                dispatch_env.dispatch(device_id, kind, &mut params)?;
                let AlgoParams::VectorEwise(p) = params else {
                    return Err(Error::invalid_state("vector ewise params expected"));
                };
                Ok(p.out)
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Assign
// ---------------------------------------------------------------------------

pub(crate) struct VectorAssignProcessor;

impl NodeProcessor for VectorAssignProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::VectorAssign { w, mask, s, .. } = &node.op else {
            return Vec::new();
        };
        let mut out = vec![(w.storage_ref(), true), (s.storage_ref(), false)];
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
        let NodeOp::VectorAssign { w, mask, s, accum } = &node.op else {
            return Err(Error::invalid_state("vector assign node expected"));
        };
        let accum = effective_accum(accum.clone(), &ctx.eff, w.element_type());
        let env = ctx.env.clone();
        let eff = ctx.eff.clone();
        let ty = w.element_type().clone();
        let scalar = s.storage().clone();
        let mask_s = mask.as_ref().map(|m| m.storage().clone());
        let dispatch_env = env.clone();

        emit_vector_destination(
            &env,
            builder,
            &ctx.eff,
            "vector_assign",
            w,
            mask,
            accum,
            move |i, dim, device_id| {
                let mask_param = match vector_mask_at(&mask_s, i, &eff)? {
                    ComputeMask::Skip => return Ok(None),
                    ComputeMask::Open => None,
                    ComputeMask::Apply(block, complement) => Some((block, complement)),
                };
                let mut params = AlgoParams::VectorAssign(ParamsVectorAssign {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    mask: mask_param,
                    size: dim,
                    value: scalar.get(),
                    out: None,
                });
                dispatch_env.dispatch(device_id, AlgoKind::VectorAssign, &mut params)?;
                let AlgoParams::VectorAssign(p) = params else {
                    return Err(Error::invalid_state("vector assign params expected"));
                };
                Ok(p.out)
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Reduce
// ---------------------------------------------------------------------------

pub(crate) struct VectorReduceProcessor;

impl NodeProcessor for VectorReduceProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::VectorReduce { s, v, .. } = &node.op else {
            return Vec::new();
        };
        vec![(s.storage_ref(), true), (v.storage_ref(), false)]
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::VectorReduce { s, op, v } = &node.op else {
            return Err(Error::invalid_state("vector reduce node expected"));
        };
        let v_s = v.storage().clone();
        let nblocks = v_s.nblock_rows();
        let device_ids = ctx.env.devices.fetch_devices(nblocks, &ctx.eff)?;
        let partials: Arc<Mutex<Vec<Option<Value>>>> =
            Arc::new(Mutex::new(vec![None; nblocks]));

        let mut partial_tasks = Vec::with_capacity(nblocks);
        for i in 0..nblocks {
            let env = ctx.env.clone();
            let eff = ctx.eff.clone();
            let ty = v.element_type().clone();
            let op = op.clone();
            let v_s = v_s.clone();
            let partials = partials.clone();
            let device_id = device_ids[i];
            let task = builder.emit(format!("vector_reduce:block{i}"), move || {
                let Some(block) = v_s.get_block(i) else {
                    return Ok(());
                };
                let mut params = AlgoParams::VectorReduce(ParamsVectorReduce {
                    desc: eff.clone(),
                    device_id,
                    ty,
                    op,
                    block,
                    out: None,
                });
                env.dispatch(device_id, AlgoKind::VectorReduce, &mut params)?;
                let AlgoParams::VectorReduce(p) = params else {
                    return Err(Error::invalid_state("vector reduce params expected"));
                };
                partials.lock().expect("reduce partials poisoned")[i] = p.out;
                Ok(())
            });
            partial_tasks.push(task);
        }

        let op = op.clone();
        let eff = ctx.eff.clone();
        let scalar = s.storage().clone();
        let fold = builder.emit("vector_reduce:fold", move || {
            let partials = partials.lock().expect("reduce partials poisoned");
            let mut acc: Option<Value> = None;
            // Fold in block order so the result is deterministic.
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
// To dense
// ---------------------------------------------------------------------------

pub(crate) struct VectorToDenseProcessor;

impl NodeProcessor for VectorToDenseProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::VectorToDense { w, v } = &node.op else {
            return Vec::new();
        };
        vec![(w.storage_ref(), true), (v.storage_ref(), false)]
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::VectorToDense { w, v } = &node.op else {
            return Err(Error::invalid_state("vector to-dense node expected"));
        };
        let w_s = w.storage().clone();
        let v_s = v.storage().clone();
        let in_place = w_s.id() == v_s.id();
        let nblocks = w_s.nblock_rows();
        let device_ids = ctx.env.devices.fetch_devices(nblocks, &ctx.eff)?;

        let clear = if in_place {
            None
        } else {
            let s = w_s.clone();
            Some(builder.emit("vector_to_dense:clear", move || {
                s.clear();
                Ok(())
            }))
        };

        for i in 0..nblocks {
            let env = ctx.env.clone();
            let eff = ctx.eff.clone();
            let ty = v.element_type().clone();
            let w_s = w_s.clone();
            let v_s = v_s.clone();
            let device_id = device_ids[i];
            let task = builder.emit(format!("vector_to_dense:block{i}"), move || {
                let Some(block) = v_s.get_block(i) else {
                    return Ok(());
                };
                let mut params = AlgoParams::VectorToDense(ParamsVectorToDense {
                    desc: eff.clone(),
                    device_id,
                    ty,
                    block,
                    out: None,
                });
                env.dispatch(device_id, AlgoKind::VectorToDense, &mut params)?;
                let AlgoParams::VectorToDense(p) = params else {
                    return Err(Error::invalid_state("vector to-dense params expected"));
                };
                w_s.set_block(i, p.out);
                Ok(())
            });
            if let Some(clear) = clear {
                builder.precede(clear, task);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bulk ingress
// ---------------------------------------------------------------------------

pub(crate) struct VectorDataWriteProcessor;

impl NodeProcessor for VectorDataWriteProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::VectorDataWrite { v, .. } = &node.op else {
            return Vec::new();
        };
        vec![(v.storage_ref(), true)]
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::VectorDataWrite { v, data } = &node.op else {
            return Err(Error::invalid_state("vector data-write node expected"));
        };
        let storage = v.storage().clone();
        let ty = v.element_type().clone();
        let accum = ctx.eff.is_param_set(Param::AccumResult);
        let nblocks = storage.nblock_rows();
        let device_ids = ctx.env.devices.fetch_devices(nblocks, &ctx.eff)?;
        type Partition = HashMap<usize, (Vec<Index>, Vec<Value>)>;
        let partition: Arc<Mutex<Partition>> = Arc::new(Mutex::new(HashMap::new()));

        let prep = {
            let data = data.clone();
            let partition = partition.clone();
            let eff = ctx.eff.clone();
            let ty = ty.clone();
            let storage = storage.clone();
            builder.emit("vector_data_write:prepare", move || {
                let mut rows = data.rows();
                let mut values = if ty.has_values() { data.values() } else { Vec::new() };
                if ty.has_values() && !rows.is_empty() && values.len() != rows.len() {
                    return Err(Error::invalid_argument(
                        "value buffer does not cover all entries",
                    ));
                }
                let nrows = storage.nrows();
                if let Some(&bad) = rows.iter().find(|&&r| r as usize >= nrows) {
                    return Err(Error::invalid_argument(format!(
                        "row index {bad} out of range (nrows={nrows})"
                    )));
                }
                for value in &values {
                    value.check_type(&ty)?;
                }
                if !eff.is_param_set(Param::ValuesSorted) {
                    primitives::sort_by_key(&mut rows, &mut values);
                }
                if !eff.is_param_set(Param::NoDuplicates) {
                    let reducer = ops::keep_first(&ty);
                    let (r, vv) = primitives::reduce_duplicates(&rows, &values, &reducer)?;
                    rows = r;
                    values = vv;
                }
                let block_size = storage.block_size();
                let mut map: Partition = HashMap::new();
                for (k, &r) in rows.iter().enumerate() {
                    let b = r as usize / block_size;
                    let slot = map.entry(b).or_default();
                    slot.0.push(r - (b * block_size) as Index);
                    if !values.is_empty() {
                        slot.1.push(values[k].clone());
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
            Some(builder.emit("vector_data_write:clear", move || {
                s.clear();
                Ok(())
            }))
        };

        for i in 0..nblocks {
            let dim = grid::block_dim(i, storage.nrows(), storage.block_size())?;
            let device_id = device_ids[i];
            let env = ctx.env.clone();
            let eff = ctx.eff.clone();
            let ty = ty.clone();
            let storage = storage.clone();
            let partition = partition.clone();
            let task = builder.emit(format!("vector_data_write:block{i}"), move || {
                let chunk = partition
                    .lock()
                    .expect("ingress partition poisoned")
                    .remove(&i);
                let Some((rows, values)) = chunk else {
                    return Ok(());
                };
                let fresh = Arc::new(VectorBlock::coo(dim, rows, values));
                if accum {
                    let mut params = AlgoParams::VectorEwise(ParamsVectorEwise {
                        desc: eff.clone(),
                        device_id,
                        ty: ty.clone(),
                        op: ops::default_accum(&ty),
                        mask: None,
                        size: dim,
                        a: storage.get_block(i),
                        b: Some(fresh),
                        out: None,
                    });
                    env.dispatch(device_id, AlgoKind::VectorEWiseAdd, &mut params)?;
                    let AlgoParams::VectorEwise(p) = params else {
                        return Err(Error::invalid_state("vector ewise params expected"));
                    };
                    storage.set_block(i, p.out);
                } else {
                    storage.set_block(i, Some(fresh));
                }
                Ok(())
            });
            builder.precede(prep, task);
            if let Some(clear) = clear {
                builder.precede(clear, task);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bulk egress
// ---------------------------------------------------------------------------

pub(crate) struct VectorDataReadProcessor;

impl NodeProcessor for VectorDataReadProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::VectorDataRead { v, .. } = &node.op else {
            return Vec::new();
        };
        vec![(v.storage_ref(), false)]
    }

    fn execute(
        &self,
        _ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::VectorDataRead { v, data } = &node.op else {
            return Err(Error::invalid_state("vector data-read node expected"));
        };
        let storage = v.storage().clone();
        let ty = v.element_type().clone();
        let nblocks = storage.nblock_rows();

        // 1. Per-block nnz; 2. per-block offsets; 3. scatter; 4. store.
        let counts: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; nblocks]));
        let offsets: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        type OutBufs = (Vec<Index>, Vec<Value>);
        let out: Arc<Mutex<OutBufs>> = Arc::new(Mutex::new((Vec::new(), Vec::new())));

        let mut count_tasks = Vec::with_capacity(nblocks);
        for i in 0..nblocks {
            let storage = storage.clone();
            let counts = counts.clone();
            let task = builder.emit(format!("vector_data_read:nnz{i}"), move || {
                let n = storage.get_block(i).map(|b| b.nvals()).unwrap_or(0);
                counts.lock().expect("egress counts poisoned")[i] = n;
                Ok(())
            });
            count_tasks.push(task);
        }

        let offsets_task = {
            let counts = counts.clone();
            let offsets = offsets.clone();
            let out = out.clone();
            let data = data.clone();
            let ty = ty.clone();
            builder.emit("vector_data_read:offsets", move || {
                let counts = counts.lock().expect("egress counts poisoned");
                let scan = primitives::exclusive_scan(&counts);
                let total = *scan.last().unwrap_or(&0);
                if data.capacity() < total {
                    return Err(Error::invalid_argument(format!(
                        "data buffers hold {} entries but the vector has {total}",
                        data.capacity()
                    )));
                }
                let mut bufs = out.lock().expect("egress buffers poisoned");
                bufs.0 = vec![0; total];
                bufs.1 = if ty.has_values() {
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

        let mut scatter_tasks = Vec::with_capacity(nblocks);
        for i in 0..nblocks {
            let storage = storage.clone();
            let offsets = offsets.clone();
            let out = out.clone();
            let task = builder.emit(format!("vector_data_read:scatter{i}"), move || {
                let Some(block) = storage.get_block(i) else {
                    return Ok(());
                };
                let base = (i * storage.block_size()) as Index;
                let (rows, values) = primitives::vector_entries(&block);
                let start = offsets.lock().expect("egress offsets poisoned")[i];
                let mut bufs = out.lock().expect("egress buffers poisoned");
                for (k, &r) in rows.iter().enumerate() {
                    bufs.0[start + k] = base + r;
                    if !bufs.1.is_empty() {
                        bufs.1[start + k] = values[k].clone();
                    }
                }
                Ok(())
            });
            builder.precede(offsets_task, task);
            scatter_tasks.push(task);
        }

        let data = data.clone();
        let store = builder.emit("vector_data_read:store", move || {
            let mut bufs = out.lock().expect("egress buffers poisoned");
            let rows = std::mem::take(&mut bufs.0);
            let values = std::mem::take(&mut bufs.1);
            data.store(rows, values)
        });
        for task in scatter_tasks {
            builder.precede(task, store);
        }
        Ok(())
    }
}
