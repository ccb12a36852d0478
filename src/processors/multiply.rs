//! Processors for the semiring products.
//!
//! Factor pairs are collected inside the task at run time, so products see
//! the blocks produced by earlier nodes of the same expression. Matrix
//! factors are fetched through the storage's cached-format decoration in
//! compressed-row form, which keeps the per-storage conversion shared
//! between tasks and dropped on any write.

use crate::block::MatrixFormat;
use crate::error::{Error, Result};
use crate::expression::{NodeData, NodeOp};
use crate::grid::BlockCoord;
use crate::registry::{AlgoKind, AlgoParams, ParamsMxM, ParamsMxV, ParamsVxM};
use crate::storage::StorageRef;

use super::{
    effective_accum, emit_matrix_destination, emit_vector_destination, matrix_mask_at,
    vector_mask_at, ComputeMask, ExecCtx, NodeProcessor, SubtaskBuilder,
};

pub(crate) struct MxVProcessor;

impl NodeProcessor for MxVProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::MxV {
            w, mask, a, v, init, ..
        } = &node.op
        else {
            return Vec::new();
        };
        let mut out = vec![
            (w.storage_ref(), true),
            (a.storage_ref(), false),
            (v.storage_ref(), false),
        ];
        if let Some(m) = mask {
            out.push((m.storage_ref(), false));
        }
        if let Some(s) = init {
            out.push((s.storage_ref(), false));
        }
        out
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::MxV {
            w,
            mask,
            a,
            v,
            mul_op,
            add_op,
            select_op,
            init,
        } = &node.op
        else {
            return Err(Error::invalid_state("mxv node expected"));
        };
        let accum = effective_accum(None, &ctx.eff, w.element_type());
        let env = ctx.env.clone();
        let eff = ctx.eff.clone();
        let ty = w.element_type().clone();
        let a_s = a.storage().clone();
        let v_s = v.storage().clone();
        let mask_s = mask.as_ref().map(|m| m.storage().clone());
        let init_s = init.as_ref().map(|s| s.storage().clone());
        let mul_op = mul_op.clone();
        let add_op = add_op.clone();
        let select_op = select_op.clone();
        let dispatch_env = env.clone();

        emit_vector_destination(
            &env,
            builder,
            &ctx.eff,
            "mxv",
            w,
            mask,
            accum,
            move |i, dim, device_id| {
                let mask_param = match vector_mask_at(&mask_s, i, &eff)? {
                    ComputeMask::Skip => return Ok(None),
                    ComputeMask::Open => None,
                    ComputeMask::Apply(block, complement) => Some((block, complement)),
                };
                let mut pairs = Vec::new();
                for k in 0..a_s.nblock_cols() {
                    let a_blk =
                        a_s.block_in_format(BlockCoord::new(i, k), MatrixFormat::Csr);
                    let v_blk = v_s.get_block(k);
                    if let (Some(a_blk), Some(v_blk)) = (a_blk, v_blk) {
                        pairs.push((a_blk, v_blk));
                    }
                }
                let mut params = AlgoParams::MxV(ParamsMxV {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    mul_op: mul_op.clone(),
                    add_op: add_op.clone(),
                    select_op: select_op.clone(),
                    init: init_s.as_ref().and_then(|s| s.get()),
                    mask: mask_param,
                    size: dim,
                    pairs,
                    out: None,
                });
                dispatch_env.dispatch(device_id, AlgoKind::MxV, &mut params)?;
                let AlgoParams::MxV(p) = params else {
                    return Err(Error::invalid_state("mxv params expected"));
                };
                Ok(p.out)
            },
        )
    }
}

pub(crate) struct VxMProcessor;

impl NodeProcessor for VxMProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::VxM {
            w, mask, v, a, init, ..
        } = &node.op
        else {
            return Vec::new();
        };
        let mut out = vec![
            (w.storage_ref(), true),
            (v.storage_ref(), false),
            (a.storage_ref(), false),
        ];
        if let Some(m) = mask {
            out.push((m.storage_ref(), false));
        }
        if let Some(s) = init {
            out.push((s.storage_ref(), false));
        }
        out
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::VxM {
            w,
            mask,
            v,
            a,
            mul_op,
            add_op,
            select_op,
            init,
        } = &node.op
        else {
            return Err(Error::invalid_state("vxm node expected"));
        };
        let accum = effective_accum(None, &ctx.eff, w.element_type());
        let env = ctx.env.clone();
        let eff = ctx.eff.clone();
        let ty = w.element_type().clone();
        let a_s = a.storage().clone();
        let v_s = v.storage().clone();
        let mask_s = mask.as_ref().map(|m| m.storage().clone());
        let init_s = init.as_ref().map(|s| s.storage().clone());
        let mul_op = mul_op.clone();
        let add_op = add_op.clone();
        let select_op = select_op.clone();
        let dispatch_env = env.clone();

        emit_vector_destination(
            &env,
            builder,
            &ctx.eff,
            "vxm",
            w,
            mask,
            accum,
            move |j, dim, device_id| {
                let mask_param = match vector_mask_at(&mask_s, j, &eff)? {
                    ComputeMask::Skip => return Ok(None),
                    ComputeMask::Open => None,
                    ComputeMask::Apply(block, complement) => Some((block, complement)),
                };
                let mut pairs = Vec::new();
                for k in 0..a_s.nblock_rows() {
                    let v_blk = v_s.get_block(k);
                    let a_blk =
                        a_s.block_in_format(BlockCoord::new(k, j), MatrixFormat::Csr);
                    if let (Some(v_blk), Some(a_blk)) = (v_blk, a_blk) {
                        pairs.push((v_blk, a_blk));
                    }
                }
                let mut params = AlgoParams::VxM(ParamsVxM {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    mul_op: mul_op.clone(),
                    add_op: add_op.clone(),
                    select_op: select_op.clone(),
                    init: init_s.as_ref().and_then(|s| s.get()),
                    mask: mask_param,
                    size: dim,
                    pairs,
                    out: None,
                });
                dispatch_env.dispatch(device_id, AlgoKind::VxM, &mut params)?;
                let AlgoParams::VxM(p) = params else {
                    return Err(Error::invalid_state("vxm params expected"));
                };
                Ok(p.out)
            },
        )
    }
}

pub(crate) struct MxMProcessor;

impl NodeProcessor for MxMProcessor {
    fn prepare(&self, node: &NodeData) -> Vec<(StorageRef, bool)> {
        let NodeOp::MxM {
            w, mask, a, b, init, ..
        } = &node.op
        else {
            return Vec::new();
        };
        let mut out = vec![
            (w.storage_ref(), true),
            (a.storage_ref(), false),
            (b.storage_ref(), false),
        ];
        if let Some(m) = mask {
            out.push((m.storage_ref(), false));
        }
        if let Some(s) = init {
            out.push((s.storage_ref(), false));
        }
        out
    }

    fn execute(
        &self,
        ctx: &ExecCtx,
        node: &NodeData,
        builder: &mut SubtaskBuilder<'_>,
    ) -> Result<()> {
        let NodeOp::MxM {
            w,
            mask,
            a,
            b,
            mul_op,
            add_op,
            init,
        } = &node.op
        else {
            return Err(Error::invalid_state("mxm node expected"));
        };
        let accum = effective_accum(None, &ctx.eff, w.element_type());
        let env = ctx.env.clone();
        let eff = ctx.eff.clone();
        let ty = w.element_type().clone();
        let a_s = a.storage().clone();
        let b_s = b.storage().clone();
        let mask_s = mask.as_ref().map(|m| m.storage().clone());
        let init_s = init.as_ref().map(|s| s.storage().clone());
        let mul_op = mul_op.clone();
        let add_op = add_op.clone();
        let dispatch_env = env.clone();

        emit_matrix_destination(
            &env,
            builder,
            &ctx.eff,
            "mxm",
            w,
            mask,
            accum,
            move |coord, nrows, ncols, device_id| {
                let mask_param = match matrix_mask_at(&mask_s, coord, &eff)? {
                    ComputeMask::Skip => return Ok(None),
                    ComputeMask::Open => None,
                    ComputeMask::Apply(block, complement) => Some((block, complement)),
                };
                let mut pairs = Vec::new();
                for k in 0..a_s.nblock_cols() {
                    let a_blk = a_s
                        .block_in_format(BlockCoord::new(coord.row, k), MatrixFormat::Csr);
                    let b_blk = b_s
                        .block_in_format(BlockCoord::new(k, coord.col), MatrixFormat::Csr);
                    if let (Some(a_blk), Some(b_blk)) = (a_blk, b_blk) {
                        pairs.push((a_blk, b_blk));
                    }
                }
                let mut params = AlgoParams::MxM(ParamsMxM {
                    desc: eff.clone(),
                    device_id,
                    ty: ty.clone(),
                    mul_op: mul_op.clone(),
                    add_op: add_op.clone(),
                    init: init_s.as_ref().and_then(|s| s.get()),
                    mask: mask_param,
                    nrows,
                    ncols,
                    pairs,
                    out: None,
                });
                dispatch_env.dispatch(device_id, AlgoKind::MxM, &mut params)?;
                let AlgoParams::MxM(p) = params else {
                    return Err(Error::invalid_state("mxm params expected"));
                };
                Ok(p.out)
            },
        )
    }
}
