//! End-to-end scenarios over the public expression API.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sparla::{
    DataMatrix, DataVector, Descriptor, Expression, ExpressionState, Index, Library,
    LibraryConfig, Param, Scalar, Status, Value, Vector,
};

fn library(block_size: usize) -> Library {
    Library::new(
        LibraryConfig::default()
            .with_block_size(block_size)
            .with_workers_count(4),
    )
    .unwrap()
}

fn iv(values: &[i32]) -> Vec<Value> {
    values.iter().map(|&v| Value::Int32(v)).collect()
}

/// Host-side reference: sort by key and keep the first of any duplicates.
fn sort_dedup(rows: &[Index], values: &[i32]) -> Vec<(Index, i32)> {
    let mut pairs: Vec<(Index, i32)> = rows.iter().copied().zip(values.iter().copied()).collect();
    pairs.sort_by_key(|&(r, _)| r);
    pairs.dedup_by_key(|&mut (r, _)| r);
    pairs
}

#[test]
fn s1_vector_reduce_to_scalar() {
    let library = library(2);
    let i32t = library.types().find_type("i32").unwrap();
    let plus = library.ops().binary("plus", &i32t).unwrap();

    let v = Vector::make(5, &i32t, &library).unwrap();
    let s = Scalar::with_value(&i32t, Value::Int32(0), &library).unwrap();
    let data = DataVector::make(vec![0, 1, 2, 3, 4], iv(&[1, 2, 3, 4, 5])).unwrap();

    let expr = Expression::make(&library);
    let write = expr.make_data_write_vector(&v, &data, None).unwrap();
    let reduce = expr.make_vector_reduce(&s, &plus, &v, None).unwrap();
    expr.dependency(write, reduce).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(s.value(), Some(Value::Int32(15)));
}

#[test]
fn s2_masked_assignment() {
    let library = library(2);
    let i32t = library.types().find_type("i32").unwrap();
    let voidt = library.types().find_type("void").unwrap();

    let w = Vector::make(4, &i32t, &library).unwrap();
    let mask = Vector::make(4, &voidt, &library).unwrap();
    let s = Scalar::with_value(&i32t, Value::Int32(7), &library).unwrap();
    let mask_data = DataVector::make(vec![1, 3], vec![]).unwrap();

    let expr = Expression::make(&library);
    let write = expr.make_data_write_vector(&mask, &mask_data, None).unwrap();
    let assign = expr
        .make_vector_assign(&w, Some(&mask), &s, None, None)
        .unwrap();
    expr.dependency(write, assign).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(w.nvals(), 2);
    assert_eq!(
        w.entries(),
        vec![(1, Value::Int32(7)), (3, Value::Int32(7))]
    );
}

#[test]
fn s3_lower_triangle_extraction() {
    let library = library(2);
    let i32t = library.types().find_type("i32").unwrap();

    let a = sparla::Matrix::make(2, 2, &i32t, &library).unwrap();
    let w = sparla::Matrix::make(2, 2, &i32t, &library).unwrap();
    let data = DataMatrix::make(vec![0, 0, 1, 1], vec![0, 1, 0, 1], iv(&[1, 2, 3, 4])).unwrap();

    let expr = Expression::make(&library);
    let write = expr.make_data_write_matrix(&a, &data, None).unwrap();
    let tril = expr.make_tril(&w, &a, None).unwrap();
    expr.dependency(write, tril).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(
        w.entries(),
        vec![
            (0, 0, Value::Int32(1)),
            (1, 0, Value::Int32(3)),
            (1, 1, Value::Int32(4)),
        ]
    );
}

#[test]
fn s5_matrix_data_round_trip() {
    let library = library(32);
    let i32t = library.types().find_type("i32").unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let nvals = 6;
    let rows: Vec<Index> = (0..nvals).map(|_| rng.gen_range(0..100)).collect();
    let cols: Vec<Index> = (0..nvals).map(|_| rng.gen_range(0..100)).collect();
    let values: Vec<i32> = (0..nvals).map(|_| rng.gen_range(-50..50)).collect();

    let m = sparla::Matrix::make(100, 100, &i32t, &library).unwrap();
    let input = DataMatrix::make(rows.clone(), cols.clone(), iv(&values)).unwrap();
    let output = DataMatrix::with_capacity(nvals);

    let expr = Expression::make(&library);
    let write = expr.make_data_write_matrix(&m, &input, None).unwrap();
    let read = expr.make_data_read_matrix(&m, &output, None).unwrap();
    expr.dependency(write, read).unwrap();
    expr.submit_wait().unwrap();

    // Reference: sorted by (row, col), duplicates reduced keep-first.
    let mut triples: Vec<(Index, Index, i32)> = (0..nvals)
        .map(|k| (rows[k], cols[k], values[k]))
        .collect();
    triples.sort_by_key(|&(r, c, _)| ((r as u64) << 32) | c as u64);
    triples.dedup_by_key(|&mut (r, c, _)| (r, c));

    let got_rows = output.rows();
    let got_cols = output.cols();
    let got_values = output.values();
    assert_eq!(got_rows.len(), triples.len());
    for (k, &(r, c, v)) in triples.iter().enumerate() {
        assert_eq!((got_rows[k], got_cols[k]), (r, c));
        assert_eq!(got_values[k], Value::Int32(v));
    }
}

#[test]
fn p1_sorted_input_round_trips_bit_for_bit() {
    let library = library(3);
    let f32t = library.types().find_type("f32").unwrap();

    let rows: Vec<Index> = vec![0, 2, 5, 9];
    let values: Vec<Value> = vec![
        Value::Float32(1.5),
        Value::Float32(-0.25),
        Value::Float32(3.75),
        Value::Float32(0.125),
    ];

    let v = Vector::make(10, &f32t, &library).unwrap();
    let mut desc = Descriptor::new();
    desc.set_param(Param::ValuesSorted);
    desc.set_param(Param::NoDuplicates);
    let input = DataVector::make(rows.clone(), values.clone()).unwrap();
    let output = DataVector::with_capacity(rows.len());

    let expr = Expression::make(&library);
    let write = expr
        .make_data_write_vector(&v, &input, Some(desc))
        .unwrap();
    let read = expr.make_data_read_vector(&v, &output, None).unwrap();
    expr.dependency(write, read).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(output.rows(), rows);
    assert_eq!(output.values(), values);
}

#[test]
fn p2_unsorted_write_equals_sorted_reduced_write() {
    let library = library(4);
    let i32t = library.types().find_type("i32").unwrap();

    let rows: Vec<Index> = vec![7, 1, 7, 3, 1, 9];
    let values = [10, 20, 30, 40, 50, 60];

    // Unhinted write sorts and reduces internally.
    let a = Vector::make(12, &i32t, &library).unwrap();
    let input = DataVector::make(rows.clone(), iv(&values)).unwrap();
    let expr = Expression::make(&library);
    expr.make_data_write_vector(&a, &input, None).unwrap();
    expr.submit_wait().unwrap();

    // Hinted write of the pre-sorted, pre-reduced reference.
    let reference = sort_dedup(&rows, &values);
    let b = Vector::make(12, &i32t, &library).unwrap();
    let mut desc = Descriptor::new();
    desc.set_param(Param::ValuesSorted);
    desc.set_param(Param::NoDuplicates);
    let ref_rows: Vec<Index> = reference.iter().map(|&(r, _)| r).collect();
    let ref_values: Vec<i32> = reference.iter().map(|&(_, v)| v).collect();
    let input = DataVector::make(ref_rows, iv(&ref_values)).unwrap();
    let expr = Expression::make(&library);
    expr.make_data_write_vector(&b, &input, Some(desc)).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(a.entries(), b.entries());
}

#[test]
fn p3_result_is_invariant_under_block_size() {
    let mut results = Vec::new();
    for block_size in [2, 3, 7, 100] {
        let library = library(block_size);
        let i32t = library.types().find_type("i32").unwrap();
        let plus = library.ops().binary("plus", &i32t).unwrap();

        let a = Vector::make(20, &i32t, &library).unwrap();
        let b = Vector::make(20, &i32t, &library).unwrap();
        let w = Vector::make(20, &i32t, &library).unwrap();
        let da = DataVector::make(vec![0, 4, 9, 13, 19], iv(&[1, 2, 3, 4, 5])).unwrap();
        let db = DataVector::make(vec![4, 9, 11], iv(&[10, 20, 30])).unwrap();

        let expr = Expression::make(&library);
        let wa = expr.make_data_write_vector(&a, &da, None).unwrap();
        let wb = expr.make_data_write_vector(&b, &db, None).unwrap();
        let add = expr
            .make_ewise_add_vector(&w, None, &plus, &a, &b, None)
            .unwrap();
        expr.dependency(wa, add).unwrap();
        expr.dependency(wb, add).unwrap();
        expr.submit_wait().unwrap();

        results.push(w.entries());
    }
    for pair in results.windows(2) {
        assert_eq!(pair[0], pair[1]);
    }
}

#[test]
fn p4_mask_and_complemented_complement_agree() {
    let library = library(3);
    let i32t = library.types().find_type("i32").unwrap();
    let voidt = library.types().find_type("void").unwrap();
    let plus = library.ops().binary("plus", &i32t).unwrap();

    let n = 10usize;
    let mask_rows: Vec<Index> = vec![1, 3, 4, 8];
    let complement_rows: Vec<Index> = (0..n as Index)
        .filter(|r| !mask_rows.contains(r))
        .collect();

    let run = |mask_rows: Vec<Index>, complemented: bool| -> Vec<(Index, Value)> {
        let a = Vector::make(n, &i32t, &library).unwrap();
        let b = Vector::make(n, &i32t, &library).unwrap();
        let w = Vector::make(n, &i32t, &library).unwrap();
        let mask = Vector::make(n, &voidt, &library).unwrap();
        let da = DataVector::make(vec![1, 3, 5], iv(&[1, 2, 3])).unwrap();
        let db = DataVector::make(vec![3, 4, 9], iv(&[10, 20, 30])).unwrap();
        let dm = DataVector::make(mask_rows, vec![]).unwrap();

        let node_desc = if complemented {
            let mut d = Descriptor::new();
            d.set_param(Param::MaskComplement);
            Some(d)
        } else {
            None
        };

        let expr = Expression::make(&library);
        let wa = expr.make_data_write_vector(&a, &da, None).unwrap();
        let wb = expr.make_data_write_vector(&b, &db, None).unwrap();
        let wm = expr.make_data_write_vector(&mask, &dm, None).unwrap();
        let add = expr
            .make_ewise_add_vector(&w, Some(&mask), &plus, &a, &b, node_desc)
            .unwrap();
        for pred in [wa, wb, wm] {
            expr.dependency(pred, add).unwrap();
        }
        expr.submit_wait().unwrap();
        w.entries()
    };

    let direct = run(mask_rows, false);
    let complemented = run(complement_rows, true);
    assert_eq!(direct, complemented);
}

#[test]
fn p5_accum_merges_with_right_bias() {
    let library = library(3);
    let i32t = library.types().find_type("i32").unwrap();
    let voidt = library.types().find_type("void").unwrap();

    let setup = |accum: bool| -> Vec<(Index, Value)> {
        let w = Vector::make(6, &i32t, &library).unwrap();
        let mask = Vector::make(6, &voidt, &library).unwrap();
        let s = Scalar::with_value(&i32t, Value::Int32(9), &library).unwrap();

        // Preload the destination.
        let preload = DataVector::make(vec![0, 2], iv(&[100, 200])).unwrap();
        let expr = Expression::make(&library);
        expr.make_data_write_vector(&w, &preload, None).unwrap();
        expr.submit_wait().unwrap();

        let dm = DataVector::make(vec![2, 5], vec![]).unwrap();
        let desc = if accum {
            let mut d = Descriptor::new();
            d.set_param(Param::AccumResult);
            Some(d)
        } else {
            None
        };
        let expr = Expression::make(&library);
        let wm = expr.make_data_write_vector(&mask, &dm, None).unwrap();
        let assign = expr
            .make_vector_assign(&w, Some(&mask), &s, None, desc)
            .unwrap();
        expr.dependency(wm, assign).unwrap();
        expr.submit_wait().unwrap();
        w.entries()
    };

    // Accum off: the destination is overwritten with the masked broadcast.
    assert_eq!(
        setup(false),
        vec![(2, Value::Int32(9)), (5, Value::Int32(9))]
    );

    // Accum on with the default right-biased operator: prior entries stay,
    // newly produced positions take the new value.
    assert_eq!(
        setup(true),
        vec![
            (0, Value::Int32(100)),
            (2, Value::Int32(9)),
            (5, Value::Int32(9)),
        ]
    );
}

#[test]
fn transpose_round_trip() {
    let library = library(2);
    let i32t = library.types().find_type("i32").unwrap();

    let a = sparla::Matrix::make(3, 5, &i32t, &library).unwrap();
    let t = sparla::Matrix::make(5, 3, &i32t, &library).unwrap();
    let data = DataMatrix::make(vec![0, 1, 2], vec![4, 0, 3], iv(&[1, 2, 3])).unwrap();

    let expr = Expression::make(&library);
    let write = expr.make_data_write_matrix(&a, &data, None).unwrap();
    let transpose = expr.make_transpose(&t, None, &a, None, None).unwrap();
    expr.dependency(write, transpose).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(
        t.entries(),
        vec![
            (0, 1, Value::Int32(2)),
            (3, 2, Value::Int32(3)),
            (4, 0, Value::Int32(1)),
        ]
    );
}

#[test]
fn to_dense_preserves_entries() {
    let library = library(4);
    let i32t = library.types().find_type("i32").unwrap();

    let v = Vector::make(10, &i32t, &library).unwrap();
    let w = Vector::make(10, &i32t, &library).unwrap();
    let data = DataVector::make(vec![1, 6, 9], iv(&[5, 6, 7])).unwrap();

    let expr = Expression::make(&library);
    let write = expr.make_data_write_vector(&v, &data, None).unwrap();
    let dense = expr.make_to_dense(&w, &v, None).unwrap();
    expr.dependency(write, dense).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(w.nvals(), 3);
    assert_eq!(
        w.entries(),
        vec![
            (1, Value::Int32(5)),
            (6, Value::Int32(6)),
            (9, Value::Int32(7)),
        ]
    );
}

#[test]
fn shape_mismatch_aborts_before_any_task() {
    let library = library(4);
    let i32t = library.types().find_type("i32").unwrap();
    let plus = library.ops().binary("plus", &i32t).unwrap();

    let a = Vector::make(5, &i32t, &library).unwrap();
    let b = Vector::make(6, &i32t, &library).unwrap();
    let w = Vector::make(5, &i32t, &library).unwrap();

    let expr = Expression::make(&library);
    expr.make_ewise_add_vector(&w, None, &plus, &a, &b, None)
        .unwrap();
    let err = expr.submit().unwrap_err();
    assert_eq!(err.status(), Status::InvalidArgument);
    assert_eq!(expr.state(), ExpressionState::Aborted);
}

#[test]
fn complement_without_mask_is_invalid_state() {
    let library = library(4);
    let i32t = library.types().find_type("i32").unwrap();
    let plus = library.ops().binary("plus", &i32t).unwrap();

    let a = Vector::make(5, &i32t, &library).unwrap();
    let b = Vector::make(5, &i32t, &library).unwrap();
    let w = Vector::make(5, &i32t, &library).unwrap();

    let mut desc = Descriptor::new();
    desc.set_param(Param::MaskComplement);
    let expr = Expression::make(&library);
    expr.make_ewise_add_vector(&w, None, &plus, &a, &b, Some(desc))
        .unwrap();
    let err = expr.submit().unwrap_err();
    assert_eq!(err.status(), Status::InvalidState);
}

#[test]
fn foreign_operator_aborts_during_execution() {
    let library = library(4);
    let i32t = library.types().find_type("i32").unwrap();
    let foreign = sparla::BinaryOp::make(
        i32t.clone(),
        i32t.clone(),
        i32t.clone(),
        "{ return a ^ b; }",
    )
    .unwrap();

    let a = Vector::make(5, &i32t, &library).unwrap();
    let b = Vector::make(5, &i32t, &library).unwrap();
    let w = Vector::make(5, &i32t, &library).unwrap();
    let da = DataVector::make(vec![1], iv(&[3])).unwrap();
    let db = DataVector::make(vec![1], iv(&[4])).unwrap();

    let expr = Expression::make(&library);
    let wa = expr.make_data_write_vector(&a, &da, None).unwrap();
    let wb = expr.make_data_write_vector(&b, &db, None).unwrap();
    let add = expr
        .make_ewise_add_vector(&w, None, &foreign, &a, &b, None)
        .unwrap();
    expr.dependency(wa, add).unwrap();
    expr.dependency(wb, add).unwrap();

    expr.submit().unwrap();
    expr.wait();
    assert_eq!(expr.state(), ExpressionState::Aborted);
    assert_eq!(expr.error().unwrap().status(), Status::NotImplemented);
}

#[test]
fn hazard_order_makes_later_nodes_see_earlier_writes() {
    // No explicit dependency between the write and the reduce; the
    // scheduler's hazard wiring must order them by node id.
    let library = library(2);
    let i32t = library.types().find_type("i32").unwrap();
    let plus = library.ops().binary("plus", &i32t).unwrap();

    let v = Vector::make(6, &i32t, &library).unwrap();
    let s = Scalar::make(&i32t, &library);
    let data = DataVector::make(vec![0, 5], iv(&[4, 5])).unwrap();

    let expr = Expression::make(&library);
    expr.make_data_write_vector(&v, &data, None).unwrap();
    expr.make_vector_reduce(&s, &plus, &v, None).unwrap();
    expr.submit_wait().unwrap();

    assert_eq!(s.value(), Some(Value::Int32(9)));
}

#[test]
fn second_expression_sees_first_expressions_effects() {
    let library = library(3);
    let i32t = library.types().find_type("i32").unwrap();
    let plus = library.ops().binary("plus", &i32t).unwrap();

    let v = Vector::make(8, &i32t, &library).unwrap();
    let s = Scalar::make(&i32t, &library);

    let data = DataVector::make(vec![0, 3, 7], iv(&[1, 2, 3])).unwrap();
    let first = Expression::make(&library);
    first.make_data_write_vector(&v, &data, None).unwrap();
    first.submit().unwrap();

    // Submitted later; must observe the completed write.
    let second = Expression::make(&library);
    second.make_vector_reduce(&s, &plus, &v, None).unwrap();
    second.submit().unwrap();

    first.wait();
    second.wait();
    assert_eq!(second.state(), ExpressionState::Evaluated);
    assert_eq!(s.value(), Some(Value::Int32(6)));
}
