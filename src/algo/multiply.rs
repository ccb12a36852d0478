//! Semiring products: matrix-matrix, matrix-vector, vector-matrix.
//!
//! Each call covers one destination block and consumes the k-indexed factor
//! pairs the processor collected at run time. Row access goes through the
//! compressed-row layout; the accumulator switches between a dense array
//! and a sorted map based on the `DenseFactor` descriptor threshold.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::block::{MatrixBlock, MatrixFormat, VectorBlock};
use crate::descriptor::{Descriptor, Param};
use crate::error::{Error, Result};
use crate::grid::Index;
use crate::ops::BinaryOp;
use crate::primitives;
use crate::registry::AlgoParams;
use crate::types::Value;

fn require_csr(block: &MatrixBlock) -> Result<&crate::block::MatrixCsr> {
    block.as_csr().ok_or_else(|| {
        Error::invalid_state("compressed-row conversion produced a different format")
    })
}

fn vec_value(block: &VectorBlock, idx: Index) -> Option<Value> {
    match block {
        VectorBlock::Coo(b) => b
            .rows
            .binary_search(&idx)
            .ok()
            .map(|i| primitives::value_at(&b.values, i)),
        VectorBlock::Dense(b) => {
            if b.mask.get(idx as usize).copied().unwrap_or(false) {
                Some(primitives::value_at(&b.values, idx as usize))
            } else {
                None
            }
        }
    }
}

/// Per-destination accumulator over a single index dimension.
enum Accum {
    Dense(Vec<Option<Value>>),
    Sparse(BTreeMap<Index, Value>),
}

impl Accum {
    fn new(size: usize, dense: bool) -> Self {
        if dense {
            Accum::Dense(vec![None; size])
        } else {
            Accum::Sparse(BTreeMap::new())
        }
    }

    fn add(
        &mut self,
        idx: Index,
        product: Value,
        add_op: &BinaryOp,
        init: &Option<Value>,
    ) -> Result<()> {
        let fresh = |product: Value| -> Result<Value> {
            match init {
                Some(seed) => add_op.apply(seed, &product),
                None => Ok(product),
            }
        };
        match self {
            Accum::Dense(slots) => {
                let slot = &mut slots[idx as usize];
                *slot = Some(match slot.take() {
                    Some(old) => add_op.apply(&old, &product)?,
                    None => fresh(product)?,
                });
            }
            Accum::Sparse(map) => {
                if let Some(old) = map.remove(&idx) {
                    map.insert(idx, add_op.apply(&old, &product)?);
                } else {
                    map.insert(idx, fresh(product)?);
                }
            }
        }
        Ok(())
    }

    fn into_entries(self) -> (Vec<Index>, Vec<Value>) {
        match self {
            Accum::Dense(slots) => {
                let mut rows = Vec::new();
                let mut values = Vec::new();
                for (i, slot) in slots.into_iter().enumerate() {
                    if let Some(v) = slot {
                        rows.push(i as Index);
                        values.push(v);
                    }
                }
                (rows, values)
            }
            Accum::Sparse(map) => {
                let mut rows = Vec::with_capacity(map.len());
                let mut values = Vec::with_capacity(map.len());
                for (i, v) in map {
                    rows.push(i);
                    values.push(v);
                }
                (rows, values)
            }
        }
    }
}

fn dense_accumulation(desc: &Descriptor, nnz_estimate: usize, size: usize) -> Result<bool> {
    let factor = desc.get_param_t::<f64>(Param::DenseFactor)?.unwrap_or(1.0);
    Ok(size > 0 && (nnz_estimate as f64) >= factor * (size as f64))
}

fn all_csr(blocks: impl Iterator<Item = MatrixFormat>) -> bool {
    let mut all = true;
    for f in blocks {
        all &= f == MatrixFormat::Csr;
    }
    all
}

// -- matrix-vector ----------------------------------------------------------

pub(super) fn select_mxv_csr(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::MxV(p) if all_csr(p.pairs.iter().map(|(a, _)| a.format())))
}

pub(super) fn select_mxv_any(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::MxV(_))
}

pub(super) fn process_mxv(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::MxV(p) = p else {
        return Err(Error::invalid_state("mxv params expected"));
    };
    let est: usize = p.pairs.iter().map(|(a, _)| a.nvals()).sum();
    let mut acc = Accum::new(p.size, dense_accumulation(&p.desc, est, p.size)?);

    for (a_blk, v_blk) in &p.pairs {
        let csr_block = primitives::matrix_to_csr(a_blk);
        let a = require_csr(&csr_block)?;
        let has_av = !a.values.is_empty();
        for r in 0..a.nrows {
            let (s, e) = (a.offsets[r] as usize, a.offsets[r + 1] as usize);
            for k in s..e {
                let c = a.cols[k];
                let Some(vv) = vec_value(v_blk, c) else {
                    continue;
                };
                if let Some(sel) = &p.select_op {
                    if !sel.apply(&vv)? {
                        continue;
                    }
                }
                let av = if has_av { a.values[k].clone() } else { Value::Void };
                let product = p.mul_op.apply(&av, &vv)?;
                acc.add(r as Index, product, &p.add_op, &p.init)?;
            }
        }
    }

    finish_vector(p.size, p.ty.has_values(), acc, &p.mask, &mut p.out);
    Ok(())
}

// -- vector-matrix ----------------------------------------------------------

pub(super) fn select_vxm_csr(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VxM(p) if all_csr(p.pairs.iter().map(|(_, a)| a.format())))
}

pub(super) fn select_vxm_any(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VxM(_))
}

pub(super) fn process_vxm(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::VxM(p) = p else {
        return Err(Error::invalid_state("vxm params expected"));
    };
    let est: usize = p.pairs.iter().map(|(_, a)| a.nvals()).sum();
    let mut acc = Accum::new(p.size, dense_accumulation(&p.desc, est, p.size)?);

    for (v_blk, a_blk) in &p.pairs {
        let csr_block = primitives::matrix_to_csr(a_blk);
        let a = require_csr(&csr_block)?;
        let has_av = !a.values.is_empty();
        let (v_rows, v_values) = primitives::vector_entries(v_blk);
        for (i, &r) in v_rows.iter().enumerate() {
            if r as usize >= a.nrows {
                continue;
            }
            let vv = primitives::value_at(&v_values, i);
            if let Some(sel) = &p.select_op {
                if !sel.apply(&vv)? {
                    continue;
                }
            }
            let (s, e) = (a.offsets[r as usize] as usize, a.offsets[r as usize + 1] as usize);
            for k in s..e {
                let c = a.cols[k];
                let av = if has_av { a.values[k].clone() } else { Value::Void };
                let product = p.mul_op.apply(&vv, &av)?;
                acc.add(c, product, &p.add_op, &p.init)?;
            }
        }
    }

    finish_vector(p.size, p.ty.has_values(), acc, &p.mask, &mut p.out);
    Ok(())
}

fn finish_vector(
    size: usize,
    has_values: bool,
    acc: Accum,
    mask: &crate::registry::VectorMask,
    out: &mut Option<Arc<VectorBlock>>,
) {
    let (rows, mut values) = acc.into_entries();
    if !has_values {
        values.clear();
    }
    let (rows, values) = match mask {
        None => (rows, values),
        Some((m, complement)) => primitives::vector_apply_mask(&rows, &values, m, *complement),
    };
    *out = if rows.is_empty() {
        None
    } else {
        Some(Arc::new(VectorBlock::coo(size, rows, values)))
    };
}

// -- matrix-matrix ----------------------------------------------------------

pub(super) fn select_mxm_csr(p: &AlgoParams) -> bool {
    matches!(
        p,
        AlgoParams::MxM(p) if all_csr(
            p.pairs.iter().flat_map(|(a, b)| [a.format(), b.format()])
        )
    )
}

pub(super) fn select_mxm_any(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::MxM(_))
}

pub(super) fn process_mxm(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::MxM(p) = p else {
        return Err(Error::invalid_state("mxm params expected"));
    };
    let mut acc: BTreeMap<(Index, Index), Value> = BTreeMap::new();

    for (a_blk, b_blk) in &p.pairs {
        let a_csr = primitives::matrix_to_csr(a_blk);
        let b_csr = primitives::matrix_to_csr(b_blk);
        let a = require_csr(&a_csr)?;
        let b = require_csr(&b_csr)?;
        let has_av = !a.values.is_empty();
        let has_bv = !b.values.is_empty();
        for r in 0..a.nrows {
            let (s1, e1) = (a.offsets[r] as usize, a.offsets[r + 1] as usize);
            for k1 in s1..e1 {
                let mid = a.cols[k1] as usize;
                if mid >= b.nrows {
                    continue;
                }
                let av = if has_av { a.values[k1].clone() } else { Value::Void };
                let (s2, e2) = (b.offsets[mid] as usize, b.offsets[mid + 1] as usize);
                for k2 in s2..e2 {
                    let c = b.cols[k2];
                    let bv = if has_bv { b.values[k2].clone() } else { Value::Void };
                    let product = p.mul_op.apply(&av, &bv)?;
                    let key = (r as Index, c);
                    if let Some(old) = acc.remove(&key) {
                        acc.insert(key, p.add_op.apply(&old, &product)?);
                    } else {
                        let seeded = match &p.init {
                            Some(seed) => p.add_op.apply(seed, &product)?,
                            None => product,
                        };
                        acc.insert(key, seeded);
                    }
                }
            }
        }
    }

    let mut rows = Vec::with_capacity(acc.len());
    let mut cols = Vec::with_capacity(acc.len());
    let mut values = Vec::with_capacity(acc.len());
    for ((r, c), v) in acc {
        rows.push(r);
        cols.push(c);
        values.push(v);
    }
    if !p.ty.has_values() {
        values.clear();
    }
    let (rows, cols, values) = match &p.mask {
        None => (rows, cols, values),
        Some((m, complement)) => {
            primitives::matrix_apply_mask(&rows, &cols, &values, m, *complement)
        }
    };
    p.out = if rows.is_empty() {
        None
    } else {
        Some(Arc::new(MatrixBlock::coo(p.nrows, p.ncols, rows, cols, values)))
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ParamsMxM, ParamsMxV, ParamsVxM};
    use crate::types::TypeCatalogue;

    fn ops() -> (Arc<crate::types::Type>, Arc<BinaryOp>, Arc<BinaryOp>) {
        let ty = TypeCatalogue::new().find_type("i32").unwrap();
        let mul = BinaryOp::make(ty.clone(), ty.clone(), ty.clone(), "*").unwrap();
        let add = BinaryOp::make(ty.clone(), ty.clone(), ty.clone(), "+").unwrap();
        (ty, mul, add)
    }

    fn vi(vals: &[i32]) -> Vec<Value> {
        vals.iter().map(|&v| Value::Int32(v)).collect()
    }

    #[test]
    fn mxv_multiplies_block_row() {
        let (ty, mul, add) = ops();
        // [[1, 2], [0, 3]] × [10, 20] = [50, 60]
        let a = MatrixBlock::coo(2, 2, vec![0, 0, 1], vec![0, 1, 1], vi(&[1, 2, 3]));
        let v = VectorBlock::coo(2, vec![0, 1], vi(&[10, 20]));
        let mut p = AlgoParams::MxV(ParamsMxV {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            mul_op: mul,
            add_op: add,
            select_op: None,
            init: None,
            mask: None,
            size: 2,
            pairs: vec![(Arc::new(a), Arc::new(v))],
            out: None,
        });
        process_mxv(&mut p).unwrap();
        let AlgoParams::MxV(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![0, 1]);
        assert_eq!(coo.values, vi(&[50, 60]));
    }

    #[test]
    fn vxm_multiplies_block_col() {
        let (ty, mul, add) = ops();
        // [10, 20] × [[1, 2], [0, 3]] = [10, 80]
        let a = MatrixBlock::coo(2, 2, vec![0, 0, 1], vec![0, 1, 1], vi(&[1, 2, 3]));
        let v = VectorBlock::coo(2, vec![0, 1], vi(&[10, 20]));
        let mut p = AlgoParams::VxM(ParamsVxM {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            mul_op: mul,
            add_op: add,
            select_op: None,
            init: None,
            mask: None,
            size: 2,
            pairs: vec![(Arc::new(v), Arc::new(a))],
            out: None,
        });
        process_vxm(&mut p).unwrap();
        let AlgoParams::VxM(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![0, 1]);
        assert_eq!(coo.values, vi(&[10, 80]));
    }

    #[test]
    fn vxm_dense_factor_switches_accumulator() {
        let (ty, mul, add) = ops();
        let a = MatrixBlock::coo(2, 2, vec![0, 1], vec![0, 1], vi(&[1, 1]));
        let v = VectorBlock::coo(2, vec![0, 1], vi(&[5, 6]));
        let mut desc = Descriptor::new();
        desc.set_param_value(Param::DenseFactor, 0.1f64);
        let mut p = AlgoParams::VxM(ParamsVxM {
            desc,
            device_id: 0,
            ty,
            mul_op: mul,
            add_op: add,
            select_op: None,
            init: None,
            mask: None,
            size: 2,
            pairs: vec![(Arc::new(v), Arc::new(a))],
            out: None,
        });
        process_vxm(&mut p).unwrap();
        let AlgoParams::VxM(p) = p else { unreachable!() };
        assert_eq!(p.out.unwrap().nvals(), 2);
    }

    #[test]
    fn mxm_contracts_inner_dimension() {
        let (ty, mul, add) = ops();
        // [[1, 2], [3, 4]] × [[5, 6], [7, 8]] = [[19, 22], [43, 50]]
        let a = MatrixBlock::coo(2, 2, vec![0, 0, 1, 1], vec![0, 1, 0, 1], vi(&[1, 2, 3, 4]));
        let b = MatrixBlock::coo(2, 2, vec![0, 0, 1, 1], vec![0, 1, 0, 1], vi(&[5, 6, 7, 8]));
        let mut p = AlgoParams::MxM(ParamsMxM {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            mul_op: mul,
            add_op: add,
            init: None,
            mask: None,
            nrows: 2,
            ncols: 2,
            pairs: vec![(Arc::new(a), Arc::new(b))],
            out: None,
        });
        process_mxm(&mut p).unwrap();
        let AlgoParams::MxM(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.values, vi(&[19, 22, 43, 50]));
    }

    #[test]
    fn structural_semiring_over_void() {
        let ty = TypeCatalogue::new().find_type("void").unwrap();
        let i32t = TypeCatalogue::new().find_type("i32").unwrap();
        let mul = BinaryOp::make(i32t.clone(), i32t.clone(), i32t.clone(), "lor").unwrap();
        let add = BinaryOp::make(i32t.clone(), i32t.clone(), i32t, "lor").unwrap();
        let a = MatrixBlock::coo(2, 2, vec![0, 1], vec![1, 0], vec![]);
        let v = VectorBlock::coo(2, vec![0], vec![]);
        let mut p = AlgoParams::VxM(ParamsVxM {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            mul_op: mul,
            add_op: add,
            select_op: None,
            init: None,
            mask: None,
            size: 2,
            pairs: vec![(Arc::new(v), Arc::new(a))],
            out: None,
        });
        process_vxm(&mut p).unwrap();
        let AlgoParams::VxM(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![1]);
        assert!(coo.values.is_empty());
    }
}
