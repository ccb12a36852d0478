//! Vector block algorithms.

use std::sync::Arc;

use crate::block::{VectorBlock, VectorFormat};
use crate::descriptor::Param;
use crate::error::{Error, Result};
use crate::grid::Index;
use crate::primitives;
use crate::registry::{AlgoParams, ParamsVectorEwise, VectorMask};
use crate::types::Value;

fn coo_or_absent(block: &Option<Arc<VectorBlock>>) -> bool {
    block
        .as_ref()
        .map(|b| b.format() == VectorFormat::Coo)
        .unwrap_or(true)
}

fn dense_present(block: &Option<Arc<VectorBlock>>) -> bool {
    block
        .as_ref()
        .map(|b| b.format() == VectorFormat::Dense)
        .unwrap_or(false)
}

fn masked(
    rows: Vec<Index>,
    values: Vec<Value>,
    mask: &VectorMask,
) -> (Vec<Index>, Vec<Value>) {
    match mask {
        None => (rows, values),
        Some((m, complement)) => primitives::vector_apply_mask(&rows, &values, m, *complement),
    }
}

fn coo_out(size: usize, rows: Vec<Index>, values: Vec<Value>) -> Option<Arc<VectorBlock>> {
    if rows.is_empty() {
        None
    } else {
        Some(Arc::new(VectorBlock::coo(size, rows, values)))
    }
}

fn ewise_entries(p: &ParamsVectorEwise) -> ((Vec<Index>, Vec<Value>), (Vec<Index>, Vec<Value>)) {
    let a = p
        .a
        .as_ref()
        .map(|b| primitives::vector_entries(b))
        .unwrap_or_default();
    let b = p
        .b
        .as_ref()
        .map(|b| primitives::vector_entries(b))
        .unwrap_or_default();
    (a, b)
}

// -- element-wise add -------------------------------------------------------

pub(super) fn select_ewise_add_coo(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VectorEwise(p) if coo_or_absent(&p.a) && coo_or_absent(&p.b))
}

pub(super) fn process_ewise_add_coo(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::VectorEwise(p) = p else {
        return Err(Error::invalid_state("vector ewise params expected"));
    };
    let ((ar, av), (br, bv)) = ewise_entries(p);
    let (rows, values) =
        primitives::merge_union(&ar, &av, &br, &bv, &p.op, p.ty.has_values())?;
    let (rows, values) = masked(rows, values, &p.mask);
    p.out = coo_out(p.size, rows, values);
    Ok(())
}

pub(super) fn select_ewise_add_dense(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VectorEwise(p) if dense_present(&p.a) && dense_present(&p.b))
}

pub(super) fn process_ewise_add_dense(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::VectorEwise(p) = p else {
        return Err(Error::invalid_state("vector ewise params expected"));
    };
    let (a, b) = match (&p.a, &p.b) {
        (Some(a), Some(b)) => (a.clone(), b.clone()),
        _ => return Err(Error::invalid_state("dense ewise requires both operands")),
    };
    let (Some(a), Some(b)) = (a.as_dense(), b.as_dense()) else {
        return Err(Error::invalid_state("dense ewise requires dense operands"));
    };
    let has_values = p.ty.has_values();
    let size = p.size;
    let mut mask_out = vec![false; size];
    let mut values = if has_values {
        vec![Value::zero_of(&p.ty); size]
    } else {
        Vec::new()
    };
    for i in 0..size {
        let (ma, mb) = (a.mask[i], b.mask[i]);
        if !(ma || mb) {
            continue;
        }
        mask_out[i] = true;
        if has_values {
            values[i] = if ma && mb {
                p.op.apply(&a.values[i], &b.values[i])?
            } else if ma {
                a.values[i].clone()
            } else {
                b.values[i].clone()
            };
        }
    }
    let block = VectorBlock::dense(size, mask_out, values);
    // Masking falls back to coordinate filtering.
    let out = if p.mask.is_some() {
        let (rows, vals) = primitives::vector_entries(&block);
        let (rows, vals) = masked(rows, vals, &p.mask);
        coo_out(size, rows, vals)
    } else if block.nvals() == 0 {
        None
    } else {
        Some(Arc::new(block))
    };
    p.out = out;
    Ok(())
}

// The general entry converts whatever formats arrive into coordinates.
pub(super) fn select_ewise_any(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VectorEwise(_))
}

// -- element-wise mult ------------------------------------------------------

pub(super) fn process_ewise_mult(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::VectorEwise(p) = p else {
        return Err(Error::invalid_state("vector ewise params expected"));
    };
    if p.a.is_none() || p.b.is_none() {
        p.out = None;
        return Ok(());
    }
    let ((ar, av), (br, bv)) = ewise_entries(p);
    let (rows, values) =
        primitives::merge_intersection(&ar, &av, &br, &bv, &p.op, p.ty.has_values())?;
    let (rows, values) = masked(rows, values, &p.mask);
    p.out = coo_out(p.size, rows, values);
    Ok(())
}

// -- assign -----------------------------------------------------------------

pub(super) fn select_assign(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VectorAssign(_))
}

pub(super) fn process_assign(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::VectorAssign(p) = p else {
        return Err(Error::invalid_state("vector assign params expected"));
    };
    let Some(value) = p.value.clone() else {
        // Empty scalar assigns nothing.
        p.out = None;
        return Ok(());
    };
    let rows: Vec<Index> = match &p.mask {
        None => (0..p.size as Index).collect(),
        Some((m, false)) => primitives::vector_entries(m).0,
        Some((m, true)) => {
            let present = primitives::vector_entries(m).0;
            let mut out = Vec::with_capacity(p.size.saturating_sub(present.len()));
            let mut it = present.iter().peekable();
            for r in 0..p.size as Index {
                if it.peek() == Some(&&r) {
                    it.next();
                } else {
                    out.push(r);
                }
            }
            out
        }
    };
    let values = if p.ty.has_values() {
        vec![value; rows.len()]
    } else {
        Vec::new()
    };
    p.out = coo_out(p.size, rows, values);
    Ok(())
}

// -- reduce -----------------------------------------------------------------

pub(super) fn select_reduce(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VectorReduce(_))
}

pub(super) fn process_reduce(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::VectorReduce(p) = p else {
        return Err(Error::invalid_state("vector reduce params expected"));
    };
    let (_, values) = primitives::vector_entries(&p.block);
    if !p.ty.has_values() {
        p.out = if p.block.nvals() > 0 {
            Some(Value::Void)
        } else {
            None
        };
        return Ok(());
    }
    let saturation = if p.desc.is_param_set(Param::EarlyExit) {
        p.op.saturation()
    } else {
        None
    };
    p.out = primitives::reduce_values(values.iter(), &p.op, None, saturation.as_ref())?;
    Ok(())
}

// -- to dense ---------------------------------------------------------------

pub(super) fn select_to_dense_coo(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VectorToDense(p) if p.block.format() == VectorFormat::Coo)
}

pub(super) fn select_to_dense_any(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::VectorToDense(_))
}

pub(super) fn process_to_dense(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::VectorToDense(p) = p else {
        return Err(Error::invalid_state("vector to-dense params expected"));
    };
    let fill = Value::zero_of(&p.ty);
    p.out = Some(Arc::new(primitives::vector_to_dense(&p.block, &fill)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::ops::BinaryOp;
    use crate::types::TypeCatalogue;

    fn setup() -> (Arc<crate::types::Type>, Arc<BinaryOp>) {
        let ty = TypeCatalogue::new().find_type("i32").unwrap();
        let op = BinaryOp::make(ty.clone(), ty.clone(), ty.clone(), "+").unwrap();
        (ty, op)
    }

    fn vi(vals: &[i32]) -> Vec<Value> {
        vals.iter().map(|&v| Value::Int32(v)).collect()
    }

    fn ewise_params(
        a: Option<VectorBlock>,
        b: Option<VectorBlock>,
        mask: VectorMask,
    ) -> AlgoParams {
        let (ty, op) = setup();
        AlgoParams::VectorEwise(ParamsVectorEwise {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            op,
            mask,
            size: 8,
            a: a.map(Arc::new),
            b: b.map(Arc::new),
            out: None,
        })
    }

    #[test]
    fn add_merges_by_index() {
        let a = VectorBlock::coo(8, vec![0, 3], vi(&[1, 2]));
        let b = VectorBlock::coo(8, vec![3, 5], vi(&[10, 20]));
        let mut p = ewise_params(Some(a), Some(b), None);
        process_ewise_add_coo(&mut p).unwrap();
        let AlgoParams::VectorEwise(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![0, 3, 5]);
        assert_eq!(coo.values, vi(&[1, 12, 20]));
    }

    #[test]
    fn add_with_one_absent_operand_copies() {
        let a = VectorBlock::coo(8, vec![1], vi(&[4]));
        let mut p = ewise_params(Some(a), None, None);
        process_ewise_add_coo(&mut p).unwrap();
        let AlgoParams::VectorEwise(p) = p else { unreachable!() };
        assert_eq!(p.out.unwrap().nvals(), 1);
    }

    #[test]
    fn mult_intersects() {
        let a = VectorBlock::coo(8, vec![0, 3], vi(&[2, 3]));
        let b = VectorBlock::coo(8, vec![3, 5], vi(&[5, 7]));
        let (ty, _) = setup();
        let times = BinaryOp::make(ty.clone(), ty.clone(), ty, "*").unwrap();
        let mut p = ewise_params(Some(a), Some(b), None);
        if let AlgoParams::VectorEwise(p) = &mut p {
            p.op = times;
        }
        process_ewise_mult(&mut p).unwrap();
        let AlgoParams::VectorEwise(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![3]);
        assert_eq!(coo.values, vi(&[15]));
    }

    #[test]
    fn dense_add_selected_only_for_dense_pairs() {
        let a = VectorBlock::dense(8, vec![true; 8], vi(&[1; 8]));
        let b = VectorBlock::dense(8, vec![true; 8], vi(&[2; 8]));
        let p = ewise_params(Some(a), Some(b), None);
        assert!(select_ewise_add_dense(&p));
        let q = ewise_params(None, None, None);
        assert!(!select_ewise_add_dense(&q));
        assert!(select_ewise_add_coo(&q));
    }

    #[test]
    fn assign_broadcasts_under_mask() {
        let (ty, _) = setup();
        let mask = VectorBlock::coo(4, vec![1, 3], vec![]);
        let mut p = AlgoParams::VectorAssign(crate::registry::ParamsVectorAssign {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            mask: Some((Arc::new(mask), false)),
            size: 4,
            value: Some(Value::Int32(7)),
            out: None,
        });
        process_assign(&mut p).unwrap();
        let AlgoParams::VectorAssign(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![1, 3]);
        assert_eq!(coo.values, vi(&[7, 7]));
    }

    #[test]
    fn assign_complement_mask_inverts() {
        let (ty, _) = setup();
        let mask = VectorBlock::coo(4, vec![1, 3], vec![]);
        let mut p = AlgoParams::VectorAssign(crate::registry::ParamsVectorAssign {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            mask: Some((Arc::new(mask), true)),
            size: 4,
            value: Some(Value::Int32(9)),
            out: None,
        });
        process_assign(&mut p).unwrap();
        let AlgoParams::VectorAssign(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        assert_eq!(out.as_coo().unwrap().rows, vec![0, 2]);
    }

    #[test]
    fn reduce_folds_block() {
        let (ty, op) = setup();
        let block = VectorBlock::coo(8, vec![0, 1, 2], vi(&[1, 2, 3]));
        let mut p = AlgoParams::VectorReduce(crate::registry::ParamsVectorReduce {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            op,
            block: Arc::new(block),
            out: None,
        });
        process_reduce(&mut p).unwrap();
        let AlgoParams::VectorReduce(p) = p else { unreachable!() };
        assert_eq!(p.out, Some(Value::Int32(6)));
    }

    #[test]
    fn to_dense_materialises() {
        let (ty, _) = setup();
        let block = VectorBlock::coo(4, vec![2], vi(&[5]));
        let mut p = AlgoParams::VectorToDense(crate::registry::ParamsVectorToDense {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            block: Arc::new(block),
            out: None,
        });
        process_to_dense(&mut p).unwrap();
        let AlgoParams::VectorToDense(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        assert_eq!(out.format(), VectorFormat::Dense);
        assert_eq!(out.nvals(), 1);
    }
}
