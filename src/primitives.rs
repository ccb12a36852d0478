//! Block-level primitives consumed by the algorithm layer.
//!
//! Format conversions, masking, sort-by-key, prefix sums, sorted merges,
//! and value reduction. Everything here operates on a single block's arrays
//! and never touches storages; the entries of a block are block-relative.

use crate::block::{MatrixBlock, MatrixCoo, VectorBlock, VectorCoo};
use crate::error::Result;
use crate::grid::Index;
use crate::ops::BinaryOp;
use crate::types::Value;

/// Clone the value at `i`, or `Void` for structure-only arrays.
#[inline]
pub fn value_at(values: &[Value], i: usize) -> Value {
    values.get(i).cloned().unwrap_or(Value::Void)
}

/// Exclusive prefix sum; output length equals input length plus one, with
/// the total in the last slot.
pub fn exclusive_scan(counts: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0usize;
    out.push(0);
    for &c in counts {
        acc += c;
        out.push(acc);
    }
    out
}

fn permute_values(values: &[Value], perm: &[usize]) -> Vec<Value> {
    if values.is_empty() {
        return Vec::new();
    }
    perm.iter().map(|&i| values[i].clone()).collect()
}

/// Stable co-sort of `(keys, values)` by key.
pub fn sort_by_key(keys: &mut Vec<Index>, values: &mut Vec<Value>) {
    let mut perm: Vec<usize> = (0..keys.len()).collect();
    perm.sort_by_key(|&i| keys[i]);
    *values = permute_values(values, &perm);
    *keys = perm.iter().map(|&i| keys[i]).collect();
}

/// Stable co-sort of matrix triples by `(row, col)`.
pub fn sort_by_row_col(rows: &mut Vec<Index>, cols: &mut Vec<Index>, values: &mut Vec<Value>) {
    let mut perm: Vec<usize> = (0..rows.len()).collect();
    perm.sort_by_key(|&i| ((rows[i] as u64) << 32) | cols[i] as u64);
    *values = permute_values(values, &perm);
    let new_rows: Vec<Index> = perm.iter().map(|&i| rows[i]).collect();
    let new_cols: Vec<Index> = perm.iter().map(|&i| cols[i]).collect();
    *rows = new_rows;
    *cols = new_cols;
}

/// Reduce adjacent duplicate keys in a sorted `(keys, values)` pair.
pub fn reduce_duplicates(
    keys: &[Index],
    values: &[Value],
    op: &BinaryOp,
) -> Result<(Vec<Index>, Vec<Value>)> {
    let has_values = !values.is_empty();
    let mut out_keys: Vec<Index> = Vec::with_capacity(keys.len());
    let mut out_values: Vec<Value> = Vec::with_capacity(values.len());
    for (i, &k) in keys.iter().enumerate() {
        if out_keys.last() == Some(&k) {
            if has_values {
                let last = out_values.len() - 1;
                out_values[last] = op.apply(&out_values[last], &values[i])?;
            }
        } else {
            out_keys.push(k);
            if has_values {
                out_values.push(values[i].clone());
            }
        }
    }
    Ok((out_keys, out_values))
}

/// Reduce adjacent duplicate `(row, col)` triples in sorted order.
pub fn reduce_duplicates_rc(
    rows: &[Index],
    cols: &[Index],
    values: &[Value],
    op: &BinaryOp,
) -> Result<(Vec<Index>, Vec<Index>, Vec<Value>)> {
    let has_values = !values.is_empty();
    let mut out_rows: Vec<Index> = Vec::with_capacity(rows.len());
    let mut out_cols: Vec<Index> = Vec::with_capacity(cols.len());
    let mut out_values: Vec<Value> = Vec::with_capacity(values.len());
    for i in 0..rows.len() {
        let dup = out_rows.last() == Some(&rows[i]) && out_cols.last() == Some(&cols[i]);
        if dup {
            if has_values {
                let last = out_values.len() - 1;
                out_values[last] = op.apply(&out_values[last], &values[i])?;
            }
        } else {
            out_rows.push(rows[i]);
            out_cols.push(cols[i]);
            if has_values {
                out_values.push(values[i].clone());
            }
        }
    }
    Ok((out_rows, out_cols, out_values))
}

/// Union-merge two sorted coordinate lists; matching keys are combined with
/// `op`. `has_values` reflects the element type, not the slices.
pub fn merge_union(
    a_keys: &[Index],
    a_values: &[Value],
    b_keys: &[Index],
    b_values: &[Value],
    op: &BinaryOp,
    has_values: bool,
) -> Result<(Vec<Index>, Vec<Value>)> {
    let mut keys = Vec::with_capacity(a_keys.len() + b_keys.len());
    let mut values = Vec::with_capacity(if has_values { a_keys.len() + b_keys.len() } else { 0 });
    let (mut i, mut j) = (0usize, 0usize);
    while i < a_keys.len() && j < b_keys.len() {
        if a_keys[i] < b_keys[j] {
            keys.push(a_keys[i]);
            if has_values {
                values.push(value_at(a_values, i));
            }
            i += 1;
        } else if b_keys[j] < a_keys[i] {
            keys.push(b_keys[j]);
            if has_values {
                values.push(value_at(b_values, j));
            }
            j += 1;
        } else {
            keys.push(a_keys[i]);
            if has_values {
                values.push(op.apply(&value_at(a_values, i), &value_at(b_values, j))?);
            }
            i += 1;
            j += 1;
        }
    }
    while i < a_keys.len() {
        keys.push(a_keys[i]);
        if has_values {
            values.push(value_at(a_values, i));
        }
        i += 1;
    }
    while j < b_keys.len() {
        keys.push(b_keys[j]);
        if has_values {
            values.push(value_at(b_values, j));
        }
        j += 1;
    }
    Ok((keys, values))
}

/// Intersection-merge two sorted coordinate lists with `op`.
pub fn merge_intersection(
    a_keys: &[Index],
    a_values: &[Value],
    b_keys: &[Index],
    b_values: &[Value],
    op: &BinaryOp,
    has_values: bool,
) -> Result<(Vec<Index>, Vec<Value>)> {
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < a_keys.len() && j < b_keys.len() {
        if a_keys[i] < b_keys[j] {
            i += 1;
        } else if b_keys[j] < a_keys[i] {
            j += 1;
        } else {
            keys.push(a_keys[i]);
            if has_values {
                values.push(op.apply(&value_at(a_values, i), &value_at(b_values, j))?);
            }
            i += 1;
            j += 1;
        }
    }
    Ok((keys, values))
}

fn pack(row: Index, col: Index) -> u64 {
    ((row as u64) << 32) | col as u64
}

/// Union-merge two `(row, col)`-sorted triple lists.
pub fn merge_union_rc(
    a: (&[Index], &[Index], &[Value]),
    b: (&[Index], &[Index], &[Value]),
    op: &BinaryOp,
    has_values: bool,
) -> Result<(Vec<Index>, Vec<Index>, Vec<Value>)> {
    let (ar, ac, av) = a;
    let (br, bc, bv) = b;
    let mut rows = Vec::with_capacity(ar.len() + br.len());
    let mut cols = Vec::with_capacity(ar.len() + br.len());
    let mut values = Vec::with_capacity(if has_values { ar.len() + br.len() } else { 0 });
    let (mut i, mut j) = (0usize, 0usize);
    while i < ar.len() && j < br.len() {
        let ka = pack(ar[i], ac[i]);
        let kb = pack(br[j], bc[j]);
        if ka < kb {
            rows.push(ar[i]);
            cols.push(ac[i]);
            if has_values {
                values.push(value_at(av, i));
            }
            i += 1;
        } else if kb < ka {
            rows.push(br[j]);
            cols.push(bc[j]);
            if has_values {
                values.push(value_at(bv, j));
            }
            j += 1;
        } else {
            rows.push(ar[i]);
            cols.push(ac[i]);
            if has_values {
                values.push(op.apply(&value_at(av, i), &value_at(bv, j))?);
            }
            i += 1;
            j += 1;
        }
    }
    while i < ar.len() {
        rows.push(ar[i]);
        cols.push(ac[i]);
        if has_values {
            values.push(value_at(av, i));
        }
        i += 1;
    }
    while j < br.len() {
        rows.push(br[j]);
        cols.push(bc[j]);
        if has_values {
            values.push(value_at(bv, j));
        }
        j += 1;
    }
    Ok((rows, cols, values))
}

/// Intersection-merge two `(row, col)`-sorted triple lists.
pub fn merge_intersection_rc(
    a: (&[Index], &[Index], &[Value]),
    b: (&[Index], &[Index], &[Value]),
    op: &BinaryOp,
    has_values: bool,
) -> Result<(Vec<Index>, Vec<Index>, Vec<Value>)> {
    let (ar, ac, av) = a;
    let (br, bc, bv) = b;
    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut values = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < ar.len() && j < br.len() {
        let ka = pack(ar[i], ac[i]);
        let kb = pack(br[j], bc[j]);
        if ka < kb {
            i += 1;
        } else if kb < ka {
            j += 1;
        } else {
            rows.push(ar[i]);
            cols.push(ac[i]);
            if has_values {
                values.push(op.apply(&value_at(av, i), &value_at(bv, j))?);
            }
            i += 1;
            j += 1;
        }
    }
    Ok((rows, cols, values))
}

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

/// Presence test for a vector mask block.
fn vector_mask_has(mask: &VectorBlock, row: Index) -> bool {
    match mask {
        VectorBlock::Coo(b) => b.rows.binary_search(&row).is_ok(),
        VectorBlock::Dense(b) => b.mask.get(row as usize).copied().unwrap_or(false),
    }
}

/// Presence test for a matrix mask block.
fn matrix_mask_has(mask: &MatrixBlock, row: Index, col: Index) -> bool {
    match mask {
        MatrixBlock::Coo(b) => {
            let key = pack(row, col);
            b.rows
                .iter()
                .zip(&b.cols)
                .any(|(&r, &c)| pack(r, c) == key)
        }
        MatrixBlock::Csr(b) => {
            let r = row as usize;
            if r + 1 >= b.offsets.len() {
                return false;
            }
            let (s, e) = (b.offsets[r] as usize, b.offsets[r + 1] as usize);
            b.cols[s..e].binary_search(&col).is_ok()
        }
        MatrixBlock::Lil(b) => b
            .rows
            .get(row as usize)
            .map(|list| list.binary_search_by_key(&col, |(c, _)| *c).is_ok())
            .unwrap_or(false),
    }
}

/// Filter sorted vector entries through a mask block.
pub fn vector_apply_mask(
    rows: &[Index],
    values: &[Value],
    mask: &VectorBlock,
    complement: bool,
) -> (Vec<Index>, Vec<Value>) {
    let has_values = !values.is_empty();
    let mut out_rows = Vec::new();
    let mut out_values = Vec::new();
    for (i, &r) in rows.iter().enumerate() {
        if vector_mask_has(mask, r) != complement {
            out_rows.push(r);
            if has_values {
                out_values.push(values[i].clone());
            }
        }
    }
    (out_rows, out_values)
}

/// Filter sorted matrix triples through a mask block.
pub fn matrix_apply_mask(
    rows: &[Index],
    cols: &[Index],
    values: &[Value],
    mask: &MatrixBlock,
    complement: bool,
) -> (Vec<Index>, Vec<Index>, Vec<Value>) {
    let has_values = !values.is_empty();
    let mut out_rows = Vec::new();
    let mut out_cols = Vec::new();
    let mut out_values = Vec::new();
    for i in 0..rows.len() {
        if matrix_mask_has(mask, rows[i], cols[i]) != complement {
            out_rows.push(rows[i]);
            out_cols.push(cols[i]);
            if has_values {
                out_values.push(values[i].clone());
            }
        }
    }
    (out_rows, out_cols, out_values)
}

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

/// Fold values with `op`, optionally seeded; `saturation` short-circuits
/// the fold once the accumulator reaches it (the `EarlyExit` hint).
pub fn reduce_values<'a>(
    vals: impl IntoIterator<Item = &'a Value>,
    op: &BinaryOp,
    seed: Option<Value>,
    saturation: Option<&Value>,
) -> Result<Option<Value>> {
    let mut acc = seed;
    for v in vals {
        acc = Some(match acc {
            None => v.clone(),
            Some(a) => op.apply(&a, v)?,
        });
        if let (Some(a), Some(s)) = (&acc, saturation) {
            if *a == *s {
                break;
            }
        }
    }
    Ok(acc)
}

// ---------------------------------------------------------------------------
// Format conversions
// ---------------------------------------------------------------------------

/// Materialise a vector block's entries as sorted `(rows, values)`.
pub fn vector_entries(block: &VectorBlock) -> (Vec<Index>, Vec<Value>) {
    match block {
        VectorBlock::Coo(b) => (b.rows.clone(), b.values.clone()),
        VectorBlock::Dense(b) => {
            let has_values = !b.values.is_empty();
            let mut rows = Vec::with_capacity(b.nvals);
            let mut values = Vec::with_capacity(if has_values { b.nvals } else { 0 });
            for (i, &m) in b.mask.iter().enumerate() {
                if m {
                    rows.push(i as Index);
                    if has_values {
                        values.push(b.values[i].clone());
                    }
                }
            }
            (rows, values)
        }
    }
}

/// Convert a vector block to the dense format.
pub fn vector_to_dense(block: &VectorBlock, fill: &Value) -> VectorBlock {
    match block {
        VectorBlock::Dense(_) => block.clone(),
        VectorBlock::Coo(b) => {
            let has_values = !b.values.is_empty();
            let mut mask = vec![false; b.nrows];
            let mut values = if has_values {
                vec![fill.clone(); b.nrows]
            } else {
                Vec::new()
            };
            for (i, &r) in b.rows.iter().enumerate() {
                mask[r as usize] = true;
                if has_values {
                    values[r as usize] = b.values[i].clone();
                }
            }
            VectorBlock::dense(b.nrows, mask, values)
        }
    }
}

/// Convert a vector block to the coordinate format.
pub fn vector_to_coo(block: &VectorBlock) -> VectorCoo {
    let (rows, values) = vector_entries(block);
    VectorCoo {
        nrows: block.nrows(),
        rows,
        values,
    }
}

/// Materialise a matrix block's entries as `(row, col)`-sorted triples.
pub fn matrix_entries(block: &MatrixBlock) -> (Vec<Index>, Vec<Index>, Vec<Value>) {
    match block {
        MatrixBlock::Coo(b) => (b.rows.clone(), b.cols.clone(), b.values.clone()),
        MatrixBlock::Csr(b) => {
            let has_values = !b.values.is_empty();
            let nnz = b.cols.len();
            let mut rows = Vec::with_capacity(nnz);
            let mut cols = Vec::with_capacity(nnz);
            let mut values = Vec::with_capacity(if has_values { nnz } else { 0 });
            for r in 0..b.nrows {
                let (s, e) = (b.offsets[r] as usize, b.offsets[r + 1] as usize);
                for k in s..e {
                    rows.push(r as Index);
                    cols.push(b.cols[k]);
                    if has_values {
                        values.push(b.values[k].clone());
                    }
                }
            }
            (rows, cols, values)
        }
        MatrixBlock::Lil(b) => {
            let mut rows = Vec::with_capacity(b.nvals);
            let mut cols = Vec::with_capacity(b.nvals);
            let mut values = Vec::with_capacity(b.nvals);
            let mut any_value = false;
            for (r, list) in b.rows.iter().enumerate() {
                for (c, v) in list {
                    rows.push(r as Index);
                    cols.push(*c);
                    if !matches!(v, Value::Void) {
                        any_value = true;
                    }
                    values.push(v.clone());
                }
            }
            if !any_value {
                values.clear();
            }
            (rows, cols, values)
        }
    }
}

/// Convert a matrix block to the coordinate format.
pub fn matrix_to_coo(block: &MatrixBlock) -> MatrixCoo {
    let (rows, cols, values) = matrix_entries(block);
    MatrixCoo {
        nrows: block.nrows(),
        ncols: block.ncols(),
        rows,
        cols,
        values,
    }
}

/// Convert a matrix block to compressed-row format.
pub fn matrix_to_csr(block: &MatrixBlock) -> MatrixBlock {
    if let MatrixBlock::Csr(_) = block {
        return block.clone();
    }
    let (rows, cols, values) = matrix_entries(block);
    let nrows = block.nrows();
    let mut counts = vec![0usize; nrows];
    for &r in &rows {
        counts[r as usize] += 1;
    }
    let scan = exclusive_scan(&counts);
    let offsets: Vec<Index> = scan.iter().map(|&o| o as Index).collect();
    // Entries are already (row, col)-sorted, so cols land sorted per row.
    MatrixBlock::csr(nrows, block.ncols(), offsets, cols, values)
}

/// Convert a matrix block to list-of-lists format.
pub fn matrix_to_lil(block: &MatrixBlock) -> MatrixBlock {
    if let MatrixBlock::Lil(_) = block {
        return block.clone();
    }
    let (rows, cols, values) = matrix_entries(block);
    let has_values = !values.is_empty();
    let mut lists: Vec<Vec<(Index, Value)>> = vec![Vec::new(); block.nrows()];
    for i in 0..rows.len() {
        let v = if has_values {
            values[i].clone()
        } else {
            Value::Void
        };
        lists[rows[i] as usize].push((cols[i], v));
    }
    MatrixBlock::lil(block.nrows(), block.ncols(), lists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::BinaryOp;
    use crate::types::{TypeCatalogue, Value};
    use std::sync::Arc;

    fn plus() -> Arc<BinaryOp> {
        let t = TypeCatalogue::new().find_type("i32").unwrap();
        BinaryOp::make(t.clone(), t.clone(), t, "+").unwrap()
    }

    fn vi(vals: &[i32]) -> Vec<Value> {
        vals.iter().map(|&v| Value::Int32(v)).collect()
    }

    #[test]
    fn scan_is_exclusive() {
        assert_eq!(exclusive_scan(&[2, 0, 3]), vec![0, 2, 2, 5]);
        assert_eq!(exclusive_scan(&[]), vec![0]);
    }

    #[test]
    fn cosort_keeps_pairs() {
        let mut keys = vec![3, 1, 2];
        let mut vals = vi(&[30, 10, 20]);
        sort_by_key(&mut keys, &mut vals);
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(vals, vi(&[10, 20, 30]));
    }

    #[test]
    fn row_col_sort_is_lexicographic() {
        let mut rows = vec![1, 0, 1, 0];
        let mut cols = vec![0, 1, 1, 0];
        let mut vals = vi(&[3, 2, 4, 1]);
        sort_by_row_col(&mut rows, &mut cols, &mut vals);
        assert_eq!(rows, vec![0, 0, 1, 1]);
        assert_eq!(cols, vec![0, 1, 0, 1]);
        assert_eq!(vals, vi(&[1, 2, 3, 4]));
    }

    #[test]
    fn duplicates_reduce_with_op() {
        let (keys, vals) = reduce_duplicates(&[1, 1, 2, 2, 2], &vi(&[1, 2, 3, 4, 5]), &plus()).unwrap();
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(vals, vi(&[3, 12]));
    }

    #[test]
    fn union_and_intersection_merges() {
        let op = plus();
        let (k, v) = merge_union(&[0, 2], &vi(&[1, 2]), &[1, 2], &vi(&[10, 20]), &op, true).unwrap();
        assert_eq!(k, vec![0, 1, 2]);
        assert_eq!(v, vi(&[1, 10, 22]));

        let (k, v) =
            merge_intersection(&[0, 2], &vi(&[1, 2]), &[1, 2], &vi(&[10, 20]), &op, true).unwrap();
        assert_eq!(k, vec![2]);
        assert_eq!(v, vi(&[22]));
    }

    #[test]
    fn mask_filters_and_complements() {
        let mask = VectorBlock::coo(4, vec![1, 3], vec![]);
        let (rows, vals) = vector_apply_mask(&[0, 1, 2, 3], &vi(&[5, 6, 7, 8]), &mask, false);
        assert_eq!(rows, vec![1, 3]);
        assert_eq!(vals, vi(&[6, 8]));

        let (rows, vals) = vector_apply_mask(&[0, 1, 2, 3], &vi(&[5, 6, 7, 8]), &mask, true);
        assert_eq!(rows, vec![0, 2]);
        assert_eq!(vals, vi(&[5, 7]));
    }

    #[test]
    fn reduce_with_seed_and_saturation() {
        let op = plus();
        let vals = vi(&[1, 2, 3]);
        let total = reduce_values(vals.iter(), &op, Some(Value::Int32(10)), None).unwrap();
        assert_eq!(total, Some(Value::Int32(16)));

        let t = TypeCatalogue::new().find_type("i32").unwrap();
        let land = BinaryOp::make(t.clone(), t.clone(), t, "land").unwrap();
        let sat = land.saturation().unwrap();
        let vals = vi(&[1, 0, 1]);
        let r = reduce_values(vals.iter(), &land, None, Some(&sat)).unwrap();
        assert_eq!(r, Some(Value::Int32(0)));
    }

    #[test]
    fn dense_round_trip() {
        let coo = VectorBlock::coo(4, vec![1, 3], vi(&[6, 8]));
        let dense = vector_to_dense(&coo, &Value::Int32(0));
        assert_eq!(dense.nvals(), 2);
        let back = vector_to_coo(&dense);
        assert_eq!(back.rows, vec![1, 3]);
        assert_eq!(back.values, vi(&[6, 8]));
    }

    #[test]
    fn csr_round_trip() {
        let coo = MatrixBlock::coo(3, 3, vec![0, 0, 2], vec![0, 2, 1], vi(&[1, 2, 3]));
        let csr = matrix_to_csr(&coo);
        assert_eq!(csr.nvals(), 3);
        let back = matrix_to_coo(&csr);
        assert_eq!(back.rows, vec![0, 0, 2]);
        assert_eq!(back.cols, vec![0, 2, 1]);
        assert_eq!(back.values, vi(&[1, 2, 3]));
    }

    #[test]
    fn lil_round_trip() {
        let coo = MatrixBlock::coo(2, 3, vec![0, 1, 1], vec![2, 0, 1], vi(&[1, 2, 3]));
        let lil = matrix_to_lil(&coo);
        assert_eq!(lil.nvals(), 3);
        let back = matrix_to_coo(&lil);
        assert_eq!(back.rows, vec![0, 1, 1]);
        assert_eq!(back.cols, vec![2, 0, 1]);
        assert_eq!(back.values, vi(&[1, 2, 3]));
    }
}
