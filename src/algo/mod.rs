//! Per-block algorithm implementations and their registration.
//!
//! Entries for an operation kind are tried in registration order: format
//! specializations first, then the general entry that converts whatever
//! arrives. Registration happens once at library construction.

use crate::registry::{AlgoKind, AlgorithmEntry, AlgorithmRegistry};

mod matrix;
mod multiply;
mod vector;

macro_rules! entry {
    ($name:literal, $select:path, $process:path) => {
        AlgorithmEntry {
            name: $name,
            select: $select,
            process: $process,
        }
    };
}

/// Seed the registry with every built-in algorithm.
pub(crate) fn register_all(reg: &mut AlgorithmRegistry) {
    reg.register(
        AlgoKind::VectorEWiseAdd,
        entry!("vector_ewise_add_dense", vector::select_ewise_add_dense, vector::process_ewise_add_dense),
    );
    reg.register(
        AlgoKind::VectorEWiseAdd,
        entry!("vector_ewise_add_coo", vector::select_ewise_add_coo, vector::process_ewise_add_coo),
    );
    reg.register(
        AlgoKind::VectorEWiseAdd,
        entry!("vector_ewise_add_general", vector::select_ewise_any, vector::process_ewise_add_coo),
    );

    reg.register(
        AlgoKind::VectorEWiseMult,
        entry!("vector_ewise_mult_coo", vector::select_ewise_any, vector::process_ewise_mult),
    );

    reg.register(
        AlgoKind::VectorAssign,
        entry!("vector_assign_coo", vector::select_assign, vector::process_assign),
    );

    reg.register(
        AlgoKind::VectorReduce,
        entry!("vector_reduce", vector::select_reduce, vector::process_reduce),
    );

    reg.register(
        AlgoKind::VectorToDense,
        entry!("vector_to_dense_coo", vector::select_to_dense_coo, vector::process_to_dense),
    );
    reg.register(
        AlgoKind::VectorToDense,
        entry!("vector_to_dense_general", vector::select_to_dense_any, vector::process_to_dense),
    );

    reg.register(
        AlgoKind::MatrixEWiseAdd,
        entry!("matrix_ewise_add_lil", matrix::select_ewise_lil, matrix::process_ewise_add_lil),
    );
    reg.register(
        AlgoKind::MatrixEWiseAdd,
        entry!("matrix_ewise_add_coo", matrix::select_ewise_any, matrix::process_ewise_add),
    );

    reg.register(
        AlgoKind::MatrixEWiseMult,
        entry!("matrix_ewise_mult_coo", matrix::select_ewise_any, matrix::process_ewise_mult),
    );

    reg.register(
        AlgoKind::MatrixReduceScalar,
        entry!("matrix_reduce_scalar", matrix::select_reduce, matrix::process_reduce),
    );

    reg.register(
        AlgoKind::MxM,
        entry!("mxm_csr", multiply::select_mxm_csr, multiply::process_mxm),
    );
    reg.register(
        AlgoKind::MxM,
        entry!("mxm_general", multiply::select_mxm_any, multiply::process_mxm),
    );

    reg.register(
        AlgoKind::MxV,
        entry!("mxv_csr", multiply::select_mxv_csr, multiply::process_mxv),
    );
    reg.register(
        AlgoKind::MxV,
        entry!("mxv_general", multiply::select_mxv_any, multiply::process_mxv),
    );

    reg.register(
        AlgoKind::VxM,
        entry!("vxm_csr", multiply::select_vxm_csr, multiply::process_vxm),
    );
    reg.register(
        AlgoKind::VxM,
        entry!("vxm_general", multiply::select_vxm_any, multiply::process_vxm),
    );

    reg.register(
        AlgoKind::Transpose,
        entry!("transpose_coo", matrix::select_transpose, matrix::process_transpose),
    );

    reg.register(
        AlgoKind::Tria,
        entry!("tria_coo", matrix::select_tria, matrix::process_tria),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_at_least_one_entry() {
        let mut reg = AlgorithmRegistry::new();
        register_all(&mut reg);
        for kind in [
            AlgoKind::VectorEWiseAdd,
            AlgoKind::VectorEWiseMult,
            AlgoKind::VectorAssign,
            AlgoKind::VectorReduce,
            AlgoKind::VectorToDense,
            AlgoKind::MatrixEWiseAdd,
            AlgoKind::MatrixEWiseMult,
            AlgoKind::MatrixReduceScalar,
            AlgoKind::MxM,
            AlgoKind::MxV,
            AlgoKind::VxM,
            AlgoKind::Transpose,
            AlgoKind::Tria,
        ] {
            assert!(!reg.entries(kind).is_empty(), "missing entries for {kind:?}");
        }
    }

    #[test]
    fn specializations_precede_general_entries() {
        let mut reg = AlgorithmRegistry::new();
        register_all(&mut reg);
        assert_eq!(
            reg.entries(AlgoKind::VectorEWiseAdd),
            vec![
                "vector_ewise_add_dense",
                "vector_ewise_add_coo",
                "vector_ewise_add_general"
            ]
        );
        assert_eq!(reg.entries(AlgoKind::VxM), vec!["vxm_csr", "vxm_general"]);
    }
}
