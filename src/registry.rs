//! Algorithm registry: dynamic per-block algorithm selection.
//!
//! An algorithm is identified by `(operation kind, entry name)`. Entries
//! for the same kind are tried in registration order; the first whose
//! `select` accepts the params is invoked through `process`. If none
//! accept, the dispatch fails with `NoAlgorithm`. Registration happens
//! during library construction; the registry is read-only while
//! expressions execute.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::{MatrixBlock, VectorBlock};
use crate::descriptor::Descriptor;
use crate::devices::DeviceId;
use crate::error::{Error, Result};
use crate::ops::{BinaryOp, SelectOp};
use crate::types::{Type, Value};

/// General kind of a block algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AlgoKind {
    VectorEWiseAdd,
    VectorEWiseMult,
    VectorAssign,
    VectorReduce,
    VectorToDense,
    MatrixEWiseAdd,
    MatrixEWiseMult,
    MatrixReduceScalar,
    MxM,
    MxV,
    VxM,
    Transpose,
    Tria,
}

impl AlgoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlgoKind::VectorEWiseAdd => "VectorEWiseAdd",
            AlgoKind::VectorEWiseMult => "VectorEWiseMult",
            AlgoKind::VectorAssign => "VectorAssign",
            AlgoKind::VectorReduce => "VectorReduce",
            AlgoKind::VectorToDense => "VectorToDense",
            AlgoKind::MatrixEWiseAdd => "MatrixEWiseAdd",
            AlgoKind::MatrixEWiseMult => "MatrixEWiseMult",
            AlgoKind::MatrixReduceScalar => "MatrixReduceScalar",
            AlgoKind::MxM => "MxM",
            AlgoKind::MxV => "MxV",
            AlgoKind::VxM => "VxM",
            AlgoKind::Transpose => "Transpose",
            AlgoKind::Tria => "Tria",
        }
    }
}

/// A mask block as a task sees it: the block plus the complement flag.
///
/// The processor resolves absence before dispatch: a regular mask with an
/// absent block short-circuits the task, a complement mask with an absent
/// block means fully unmasked (`None` here).
pub type VectorMask = Option<(Arc<VectorBlock>, bool)>;
/// Matrix counterpart of [`VectorMask`].
pub type MatrixMask = Option<(Arc<MatrixBlock>, bool)>;

/// Element-wise add/mult over two optional vector blocks.
pub struct ParamsVectorEwise {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub op: Arc<BinaryOp>,
    pub mask: VectorMask,
    pub size: usize,
    pub a: Option<Arc<VectorBlock>>,
    pub b: Option<Arc<VectorBlock>>,
    pub out: Option<Arc<VectorBlock>>,
}

/// Scalar broadcast into a vector block under a mask.
pub struct ParamsVectorAssign {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub mask: VectorMask,
    pub size: usize,
    pub value: Option<Value>,
    pub out: Option<Arc<VectorBlock>>,
}

/// Reduce one vector block into a partial scalar.
pub struct ParamsVectorReduce {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub op: Arc<BinaryOp>,
    pub block: Arc<VectorBlock>,
    pub out: Option<Value>,
}

/// Materialise a vector block in the dense format.
pub struct ParamsVectorToDense {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub block: Arc<VectorBlock>,
    pub out: Option<Arc<VectorBlock>>,
}

/// Element-wise add/mult over two optional matrix blocks.
pub struct ParamsMatrixEwise {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub op: Arc<BinaryOp>,
    pub mask: MatrixMask,
    pub nrows: usize,
    pub ncols: usize,
    pub a: Option<Arc<MatrixBlock>>,
    pub b: Option<Arc<MatrixBlock>>,
    pub out: Option<Arc<MatrixBlock>>,
}

/// Reduce one matrix block into a partial scalar.
pub struct ParamsMatrixReduce {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub op: Arc<BinaryOp>,
    pub mask: MatrixMask,
    pub block: Arc<MatrixBlock>,
    pub out: Option<Value>,
}

/// Matrix-matrix product for one destination block: the k-indexed pairs
/// `(a[i,k], b[k,j])` where both factors are present.
pub struct ParamsMxM {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub mul_op: Arc<BinaryOp>,
    pub add_op: Arc<BinaryOp>,
    pub init: Option<Value>,
    pub mask: MatrixMask,
    pub nrows: usize,
    pub ncols: usize,
    pub pairs: Vec<(Arc<MatrixBlock>, Arc<MatrixBlock>)>,
    pub out: Option<Arc<MatrixBlock>>,
}

/// Matrix-vector product for one destination block.
pub struct ParamsMxV {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub mul_op: Arc<BinaryOp>,
    pub add_op: Arc<BinaryOp>,
    pub select_op: Option<Arc<SelectOp>>,
    pub init: Option<Value>,
    pub mask: VectorMask,
    pub size: usize,
    pub pairs: Vec<(Arc<MatrixBlock>, Arc<VectorBlock>)>,
    pub out: Option<Arc<VectorBlock>>,
}

/// Vector-matrix product for one destination block.
pub struct ParamsVxM {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub mul_op: Arc<BinaryOp>,
    pub add_op: Arc<BinaryOp>,
    pub select_op: Option<Arc<SelectOp>>,
    pub init: Option<Value>,
    pub mask: VectorMask,
    pub size: usize,
    pub pairs: Vec<(Arc<VectorBlock>, Arc<MatrixBlock>)>,
    pub out: Option<Arc<VectorBlock>>,
}

/// Block transpose: source block is the mirrored coordinate's.
pub struct ParamsTranspose {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub mask: MatrixMask,
    pub a: Arc<MatrixBlock>,
    pub out: Option<Arc<MatrixBlock>>,
}

/// Triangular extraction with the block's global offsets.
pub struct ParamsTria {
    pub desc: Descriptor,
    pub device_id: DeviceId,
    pub ty: Arc<Type>,
    pub lower: bool,
    pub row_base: u64,
    pub col_base: u64,
    pub a: Arc<MatrixBlock>,
    pub out: Option<Arc<MatrixBlock>>,
}

/// Operation-specific params handed through the registry.
pub enum AlgoParams {
    VectorEwise(ParamsVectorEwise),
    VectorAssign(ParamsVectorAssign),
    VectorReduce(ParamsVectorReduce),
    VectorToDense(ParamsVectorToDense),
    MatrixEwise(ParamsMatrixEwise),
    MatrixReduce(ParamsMatrixReduce),
    MxM(ParamsMxM),
    MxV(ParamsMxV),
    VxM(ParamsVxM),
    Transpose(ParamsTranspose),
    Tria(ParamsTria),
}

/// One candidate implementation for an operation kind.
pub struct AlgorithmEntry {
    pub name: &'static str,
    pub select: fn(&AlgoParams) -> bool,
    pub process: fn(&mut AlgoParams) -> Result<()>,
}

/// The lookup table consulted at task dispatch.
pub struct AlgorithmRegistry {
    table: HashMap<AlgoKind, Vec<AlgorithmEntry>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Append an entry; entries are tried in registration order.
    pub fn register(&mut self, kind: AlgoKind, entry: AlgorithmEntry) {
        self.table.entry(kind).or_default().push(entry);
    }

    /// Dispatch the first accepting entry for `kind`.
    pub fn dispatch(&self, kind: AlgoKind, params: &mut AlgoParams) -> Result<()> {
        let entries = self.table.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        for entry in entries {
            if (entry.select)(params) {
                tracing::trace!(kind = kind.as_str(), entry = entry.name, "dispatch algorithm");
                return (entry.process)(params);
            }
        }
        Err(Error::no_algorithm(format!(
            "no registered algorithm accepts {} params",
            kind.as_str()
        )))
    }

    /// Registered entry names for a kind, in trial order.
    pub fn entries(&self, kind: AlgoKind) -> Vec<&'static str> {
        self.table
            .get(&kind)
            .map(|v| v.iter().map(|e| e.name).collect())
            .unwrap_or_default()
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCatalogue;

    fn probe_params() -> AlgoParams {
        let ty = TypeCatalogue::new().find_type("i32").unwrap();
        AlgoParams::VectorToDense(ParamsVectorToDense {
            desc: Descriptor::new(),
            device_id: 0,
            ty: ty.clone(),
            block: Arc::new(VectorBlock::coo(4, vec![0], vec![Value::Int32(1)])),
            out: None,
        })
    }

    #[test]
    fn dispatch_tries_entries_in_registration_order() {
        let mut reg = AlgorithmRegistry::new();
        reg.register(
            AlgoKind::VectorToDense,
            AlgorithmEntry {
                name: "never",
                select: |_| false,
                process: |_| Err(Error::generic("must not run")),
            },
        );
        reg.register(
            AlgoKind::VectorToDense,
            AlgorithmEntry {
                name: "always",
                select: |_| true,
                process: |_| Ok(()),
            },
        );
        let mut params = probe_params();
        assert!(reg.dispatch(AlgoKind::VectorToDense, &mut params).is_ok());
        assert_eq!(reg.entries(AlgoKind::VectorToDense), vec!["never", "always"]);
    }

    #[test]
    fn no_accepting_entry_is_no_algorithm() {
        let reg = AlgorithmRegistry::new();
        let mut params = probe_params();
        let err = reg.dispatch(AlgoKind::VectorToDense, &mut params).unwrap_err();
        assert_eq!(err.status(), crate::error::Status::NoAlgorithm);
    }
}
