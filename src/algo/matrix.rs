//! Matrix block algorithms.

use std::sync::Arc;

use crate::block::{MatrixBlock, MatrixFormat};
use crate::descriptor::Param;
use crate::error::{Error, Result};
use crate::grid::Index;
use crate::primitives;
use crate::registry::{AlgoParams, MatrixMask, ParamsMatrixEwise};
use crate::types::Value;

fn masked(
    rows: Vec<Index>,
    cols: Vec<Index>,
    values: Vec<Value>,
    mask: &MatrixMask,
) -> (Vec<Index>, Vec<Index>, Vec<Value>) {
    match mask {
        None => (rows, cols, values),
        Some((m, complement)) => {
            primitives::matrix_apply_mask(&rows, &cols, &values, m, *complement)
        }
    }
}

fn coo_out(
    nrows: usize,
    ncols: usize,
    rows: Vec<Index>,
    cols: Vec<Index>,
    values: Vec<Value>,
) -> Option<Arc<MatrixBlock>> {
    if rows.is_empty() {
        None
    } else {
        Some(Arc::new(MatrixBlock::coo(nrows, ncols, rows, cols, values)))
    }
}

fn ewise_triples(
    p: &ParamsMatrixEwise,
) -> (
    (Vec<Index>, Vec<Index>, Vec<Value>),
    (Vec<Index>, Vec<Index>, Vec<Value>),
) {
    let a = p
        .a
        .as_ref()
        .map(|b| primitives::matrix_entries(b))
        .unwrap_or_default();
    let b = p
        .b
        .as_ref()
        .map(|b| primitives::matrix_entries(b))
        .unwrap_or_default();
    (a, b)
}

// -- element-wise add -------------------------------------------------------

pub(super) fn select_ewise_lil(p: &AlgoParams) -> bool {
    let lil = |b: &Option<Arc<MatrixBlock>>| {
        b.as_ref()
            .map(|b| b.format() == MatrixFormat::Lil)
            .unwrap_or(false)
    };
    matches!(p, AlgoParams::MatrixEwise(p) if lil(&p.a) && lil(&p.b))
}

pub(super) fn process_ewise_add_lil(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::MatrixEwise(p) = p else {
        return Err(Error::invalid_state("matrix ewise params expected"));
    };
    let (a, b) = match (&p.a, &p.b) {
        (Some(a), Some(b)) => (a.clone(), b.clone()),
        _ => return Err(Error::invalid_state("lil ewise requires both operands")),
    };
    let (Some(a), Some(b)) = (a.as_lil(), b.as_lil()) else {
        return Err(Error::invalid_state("lil ewise requires lil operands"));
    };
    let has_values = p.ty.has_values();
    let mut lists: Vec<Vec<(Index, Value)>> = Vec::with_capacity(p.nrows);
    for r in 0..p.nrows {
        let ra = a.rows.get(r).map(Vec::as_slice).unwrap_or(&[]);
        let rb = b.rows.get(r).map(Vec::as_slice).unwrap_or(&[]);
        let mut merged = Vec::with_capacity(ra.len() + rb.len());
        let (mut i, mut j) = (0usize, 0usize);
        while i < ra.len() && j < rb.len() {
            if ra[i].0 < rb[j].0 {
                merged.push(ra[i].clone());
                i += 1;
            } else if rb[j].0 < ra[i].0 {
                merged.push(rb[j].clone());
                j += 1;
            } else {
                let v = if has_values {
                    p.op.apply(&ra[i].1, &rb[j].1)?
                } else {
                    Value::Void
                };
                merged.push((ra[i].0, v));
                i += 1;
                j += 1;
            }
        }
        merged.extend_from_slice(&ra[i..]);
        merged.extend_from_slice(&rb[j..]);
        lists.push(merged);
    }
    let block = MatrixBlock::lil(p.nrows, p.ncols, lists);
    p.out = if p.mask.is_some() {
        let (rows, cols, values) = primitives::matrix_entries(&block);
        let (rows, cols, values) = masked(rows, cols, values, &p.mask);
        coo_out(p.nrows, p.ncols, rows, cols, values)
    } else if block.nvals() == 0 {
        None
    } else {
        Some(Arc::new(block))
    };
    Ok(())
}

pub(super) fn select_ewise_any(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::MatrixEwise(_))
}

pub(super) fn process_ewise_add(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::MatrixEwise(p) = p else {
        return Err(Error::invalid_state("matrix ewise params expected"));
    };
    let (a, b) = ewise_triples(p);
    let (rows, cols, values) = primitives::merge_union_rc(
        (&a.0, &a.1, &a.2),
        (&b.0, &b.1, &b.2),
        &p.op,
        p.ty.has_values(),
    )?;
    let (rows, cols, values) = masked(rows, cols, values, &p.mask);
    p.out = coo_out(p.nrows, p.ncols, rows, cols, values);
    Ok(())
}

// -- element-wise mult ------------------------------------------------------

pub(super) fn process_ewise_mult(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::MatrixEwise(p) = p else {
        return Err(Error::invalid_state("matrix ewise params expected"));
    };
    if p.a.is_none() || p.b.is_none() {
        p.out = None;
        return Ok(());
    }
    let (a, b) = ewise_triples(p);
    let (rows, cols, values) = primitives::merge_intersection_rc(
        (&a.0, &a.1, &a.2),
        (&b.0, &b.1, &b.2),
        &p.op,
        p.ty.has_values(),
    )?;
    let (rows, cols, values) = masked(rows, cols, values, &p.mask);
    p.out = coo_out(p.nrows, p.ncols, rows, cols, values);
    Ok(())
}

// -- reduce to scalar -------------------------------------------------------

pub(super) fn select_reduce(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::MatrixReduce(_))
}

pub(super) fn process_reduce(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::MatrixReduce(p) = p else {
        return Err(Error::invalid_state("matrix reduce params expected"));
    };
    let (rows, cols, values) = primitives::matrix_entries(&p.block);
    let (rows, _, values) = masked(rows, cols, values, &p.mask);
    if !p.ty.has_values() {
        p.out = if rows.is_empty() { None } else { Some(Value::Void) };
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

// -- transpose --------------------------------------------------------------

pub(super) fn select_transpose(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::Transpose(_))
}

pub(super) fn process_transpose(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::Transpose(p) = p else {
        return Err(Error::invalid_state("transpose params expected"));
    };
    let (mut rows, mut cols, mut values) = primitives::matrix_entries(&p.a);
    std::mem::swap(&mut rows, &mut cols);
    primitives::sort_by_row_col(&mut rows, &mut cols, &mut values);
    let (rows, cols, values) = masked(rows, cols, values, &p.mask);
    p.out = coo_out(p.a.ncols(), p.a.nrows(), rows, cols, values);
    Ok(())
}

// -- triangular extraction --------------------------------------------------

pub(super) fn select_tria(p: &AlgoParams) -> bool {
    matches!(p, AlgoParams::Tria(_))
}

pub(super) fn process_tria(p: &mut AlgoParams) -> Result<()> {
    let AlgoParams::Tria(p) = p else {
        return Err(Error::invalid_state("tria params expected"));
    };
    let (rows, cols, values) = primitives::matrix_entries(&p.a);
    let has_values = !values.is_empty();
    let mut out_rows = Vec::new();
    let mut out_cols = Vec::new();
    let mut out_values = Vec::new();
    for i in 0..rows.len() {
        let gr = p.row_base + rows[i] as u64;
        let gc = p.col_base + cols[i] as u64;
        let keep = if p.lower { gr >= gc } else { gc >= gr };
        if keep {
            out_rows.push(rows[i]);
            out_cols.push(cols[i]);
            if has_values {
                out_values.push(values[i].clone());
            }
        }
    }
    p.out = coo_out(p.a.nrows(), p.a.ncols(), out_rows, out_cols, out_values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::ops::BinaryOp;
    use crate::registry::{ParamsMatrixReduce, ParamsTranspose, ParamsTria};
    use crate::types::TypeCatalogue;

    fn setup() -> (Arc<crate::types::Type>, Arc<BinaryOp>) {
        let ty = TypeCatalogue::new().find_type("i32").unwrap();
        let op = BinaryOp::make(ty.clone(), ty.clone(), ty.clone(), "+").unwrap();
        (ty, op)
    }

    fn vi(vals: &[i32]) -> Vec<Value> {
        vals.iter().map(|&v| Value::Int32(v)).collect()
    }

    #[test]
    fn add_unions_triples() {
        let (ty, op) = setup();
        let a = MatrixBlock::coo(4, 4, vec![0, 1], vec![1, 2], vi(&[1, 2]));
        let b = MatrixBlock::coo(4, 4, vec![1, 3], vec![2, 0], vi(&[10, 20]));
        let mut p = AlgoParams::MatrixEwise(ParamsMatrixEwise {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            op,
            mask: None,
            nrows: 4,
            ncols: 4,
            a: Some(Arc::new(a)),
            b: Some(Arc::new(b)),
            out: None,
        });
        process_ewise_add(&mut p).unwrap();
        let AlgoParams::MatrixEwise(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![0, 1, 3]);
        assert_eq!(coo.cols, vec![1, 2, 0]);
        assert_eq!(coo.values, vi(&[1, 12, 20]));
    }

    #[test]
    fn lil_add_merges_rows() {
        let (ty, op) = setup();
        let a = primitives::matrix_to_lil(&MatrixBlock::coo(
            2,
            3,
            vec![0, 1],
            vec![0, 1],
            vi(&[1, 2]),
        ));
        let b = primitives::matrix_to_lil(&MatrixBlock::coo(
            2,
            3,
            vec![0, 1],
            vec![0, 2],
            vi(&[5, 7]),
        ));
        let mut p = AlgoParams::MatrixEwise(ParamsMatrixEwise {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            op,
            mask: None,
            nrows: 2,
            ncols: 3,
            a: Some(Arc::new(a)),
            b: Some(Arc::new(b)),
            out: None,
        });
        assert!(select_ewise_lil(&p));
        process_ewise_add_lil(&mut p).unwrap();
        let AlgoParams::MatrixEwise(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        assert_eq!(out.format(), MatrixFormat::Lil);
        assert_eq!(out.nvals(), 3);
        let coo = primitives::matrix_to_coo(&out);
        assert_eq!(coo.values, vi(&[6, 2, 7]));
    }

    #[test]
    fn reduce_folds_all_entries() {
        let (ty, op) = setup();
        let block = MatrixBlock::coo(4, 4, vec![0, 1], vec![1, 2], vi(&[3, 4]));
        let mut p = AlgoParams::MatrixReduce(ParamsMatrixReduce {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            op,
            mask: None,
            block: Arc::new(block),
            out: None,
        });
        process_reduce(&mut p).unwrap();
        let AlgoParams::MatrixReduce(p) = p else { unreachable!() };
        assert_eq!(p.out, Some(Value::Int32(7)));
    }

    #[test]
    fn transpose_swaps_and_sorts() {
        let (ty, _) = setup();
        let block = MatrixBlock::coo(2, 3, vec![0, 0, 1], vec![1, 2, 0], vi(&[1, 2, 3]));
        let mut p = AlgoParams::Transpose(ParamsTranspose {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            mask: None,
            a: Arc::new(block),
            out: None,
        });
        process_transpose(&mut p).unwrap();
        let AlgoParams::Transpose(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!((coo.nrows, coo.ncols), (3, 2));
        assert_eq!(coo.rows, vec![0, 1, 2]);
        assert_eq!(coo.cols, vec![1, 0, 0]);
        assert_eq!(coo.values, vi(&[3, 1, 2]));
    }

    #[test]
    fn tril_keeps_diagonal_and_below() {
        let (ty, _) = setup();
        let block = MatrixBlock::coo(2, 2, vec![0, 0, 1, 1], vec![0, 1, 0, 1], vi(&[1, 2, 3, 4]));
        let mut p = AlgoParams::Tria(ParamsTria {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            lower: true,
            row_base: 0,
            col_base: 0,
            a: Arc::new(block),
            out: None,
        });
        process_tria(&mut p).unwrap();
        let AlgoParams::Tria(p) = p else { unreachable!() };
        let out = p.out.unwrap();
        let coo = out.as_coo().unwrap();
        assert_eq!(coo.rows, vec![0, 1, 1]);
        assert_eq!(coo.cols, vec![0, 0, 1]);
        assert_eq!(coo.values, vi(&[1, 3, 4]));
    }

    #[test]
    fn tria_respects_global_offsets() {
        let (ty, _) = setup();
        // Block sits fully above the diagonal in global coordinates.
        let block = MatrixBlock::coo(2, 2, vec![0, 1], vec![0, 1], vi(&[1, 2]));
        let mut p = AlgoParams::Tria(ParamsTria {
            desc: Descriptor::new(),
            device_id: 0,
            ty,
            lower: true,
            row_base: 0,
            col_base: 100,
            a: Arc::new(block),
            out: None,
        });
        process_tria(&mut p).unwrap();
        let AlgoParams::Tria(p) = p else { unreachable!() };
        assert!(p.out.is_none());
    }
}
