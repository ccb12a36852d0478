//! Expression model: user-built DAGs of typed operations.
//!
//! An expression is a mutable builder until submitted, after which it is
//! frozen. Nodes carry an operation with its arguments, an optional own
//! descriptor, and explicit precedence edges; the expression carries a
//! state transitioned monotonically by the scheduler:
//! `Default → Submitted → {Evaluated, Aborted}`.
//!
//! The internal task graph lives until the expression's last handle drops,
//! but never dies before all its tasks completed: the drop waits on the
//! running graph.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::data::{DataMatrix, DataVector};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::ops::{BinaryOp, SelectOp};
use crate::pool::ExecShared;
use crate::tensor::{Matrix, Scalar, Vector};
use crate::Library;

/// State of an expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExpressionState {
    /// Built but not submitted.
    Default = 0,
    /// Submitted for evaluation.
    Submitted = 1,
    /// Successfully evaluated.
    Evaluated = 2,
    /// Aborted (not evaluated).
    Aborted = 3,
}

impl ExpressionState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => ExpressionState::Default,
            1 => ExpressionState::Submitted,
            2 => ExpressionState::Evaluated,
            _ => ExpressionState::Aborted,
        }
    }
}

/// Handle to a node inside its expression, usable as a precedence endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeId(pub(crate) usize);

/// Operation of one expression node, with its typed arguments.
pub(crate) enum NodeOp {
    VectorDataWrite {
        v: Vector,
        data: DataVector,
    },
    VectorDataRead {
        v: Vector,
        data: DataVector,
    },
    MatrixDataWrite {
        m: Matrix,
        data: DataMatrix,
    },
    MatrixDataRead {
        m: Matrix,
        data: DataMatrix,
    },
    VectorEWiseAdd {
        w: Vector,
        mask: Option<Vector>,
        op: Arc<BinaryOp>,
        a: Vector,
        b: Vector,
    },
    VectorEWiseMult {
        w: Vector,
        mask: Option<Vector>,
        op: Arc<BinaryOp>,
        a: Vector,
        b: Vector,
    },
    MatrixEWiseAdd {
        w: Matrix,
        mask: Option<Matrix>,
        op: Arc<BinaryOp>,
        a: Matrix,
        b: Matrix,
    },
    MatrixEWiseMult {
        w: Matrix,
        mask: Option<Matrix>,
        op: Arc<BinaryOp>,
        a: Matrix,
        b: Matrix,
    },
    MxM {
        w: Matrix,
        mask: Option<Matrix>,
        a: Matrix,
        b: Matrix,
        mul_op: Arc<BinaryOp>,
        add_op: Arc<BinaryOp>,
        init: Option<Scalar>,
    },
    MxV {
        w: Vector,
        mask: Option<Vector>,
        a: Matrix,
        v: Vector,
        mul_op: Arc<BinaryOp>,
        add_op: Arc<BinaryOp>,
        select_op: Option<Arc<SelectOp>>,
        init: Option<Scalar>,
    },
    VxM {
        w: Vector,
        mask: Option<Vector>,
        v: Vector,
        a: Matrix,
        mul_op: Arc<BinaryOp>,
        add_op: Arc<BinaryOp>,
        select_op: Option<Arc<SelectOp>>,
        init: Option<Scalar>,
    },
    VectorReduce {
        s: Scalar,
        op: Arc<BinaryOp>,
        v: Vector,
    },
    MatrixReduceScalar {
        s: Scalar,
        op: Arc<BinaryOp>,
        m: Matrix,
        mask: Option<Matrix>,
    },
    VectorAssign {
        w: Vector,
        mask: Option<Vector>,
        s: Scalar,
        accum: Option<Arc<BinaryOp>>,
    },
    Transpose {
        w: Matrix,
        mask: Option<Matrix>,
        a: Matrix,
        accum: Option<Arc<BinaryOp>>,
    },
    Tril {
        w: Matrix,
        a: Matrix,
    },
    Triu {
        w: Matrix,
        a: Matrix,
    },
    VectorToDense {
        w: Vector,
        v: Vector,
    },
}

impl NodeOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            NodeOp::VectorDataWrite { .. } => "VectorDataWrite",
            NodeOp::VectorDataRead { .. } => "VectorDataRead",
            NodeOp::MatrixDataWrite { .. } => "MatrixDataWrite",
            NodeOp::MatrixDataRead { .. } => "MatrixDataRead",
            NodeOp::VectorEWiseAdd { .. } => "VectorEWiseAdd",
            NodeOp::VectorEWiseMult { .. } => "VectorEWiseMult",
            NodeOp::MatrixEWiseAdd { .. } => "MatrixEWiseAdd",
            NodeOp::MatrixEWiseMult { .. } => "MatrixEWiseMult",
            NodeOp::MxM { .. } => "MxM",
            NodeOp::MxV { .. } => "MxV",
            NodeOp::VxM { .. } => "VxM",
            NodeOp::VectorReduce { .. } => "VectorReduce",
            NodeOp::MatrixReduceScalar { .. } => "MatrixReduceScalar",
            NodeOp::VectorAssign { .. } => "VectorAssign",
            NodeOp::Transpose { .. } => "Transpose",
            NodeOp::Tril { .. } => "Tril",
            NodeOp::Triu { .. } => "Triu",
            NodeOp::VectorToDense { .. } => "VectorToDense",
        }
    }
}

/// One node of an expression.
pub(crate) struct NodeData {
    pub id: usize,
    pub op: NodeOp,
    pub desc: Option<Descriptor>,
}

pub(crate) struct ExpressionInner {
    pub library: Library,
    pub desc: Mutex<Option<Descriptor>>,
    pub nodes: Mutex<Vec<NodeData>>,
    /// Explicit precedence edges `(pred, succ)`.
    pub edges: Mutex<Vec<(usize, usize)>>,
    state: AtomicU8,
    error: Mutex<Option<Error>>,
    exec: Mutex<Option<Arc<ExecShared>>>,
}

impl ExpressionInner {
    fn frozen(&self) -> bool {
        self.state.load(Ordering::Acquire) != ExpressionState::Default as u8
    }

    pub(crate) fn set_submitted(&self, exec: Arc<ExecShared>) {
        *self.exec.lock().expect("expression exec slot poisoned") = Some(exec);
        self.state
            .store(ExpressionState::Submitted as u8, Ordering::Release);
    }

    pub(crate) fn set_aborted(&self, err: Error) {
        let mut slot = self.error.lock().expect("expression error slot poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
        self.state
            .store(ExpressionState::Aborted as u8, Ordering::Release);
    }
}

impl Drop for ExpressionInner {
    fn drop(&mut self) {
        // The task graph must not be destroyed before all tasks completed.
        if let Ok(slot) = self.exec.lock() {
            if let Some(exec) = slot.as_ref() {
                exec.wait();
            }
        }
    }
}

/// A user-built DAG of operations, submitted as a unit.
#[derive(Clone)]
pub struct Expression {
    pub(crate) inner: Arc<ExpressionInner>,
}

impl Expression {
    /// Create an empty expression bound to `library`.
    pub fn make(library: &Library) -> Self {
        Self {
            inner: Arc::new(ExpressionInner {
                library: library.clone(),
                desc: Mutex::new(None),
                nodes: Mutex::new(Vec::new()),
                edges: Mutex::new(Vec::new()),
                state: AtomicU8::new(ExpressionState::Default as u8),
                error: Mutex::new(None),
                exec: Mutex::new(None),
            }),
        }
    }

    /// Attach an expression-level descriptor.
    pub fn set_descriptor(&self, desc: Descriptor) -> Result<()> {
        self.check_mutable()?;
        *self.inner.desc.lock().expect("expression desc poisoned") = Some(desc);
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> ExpressionState {
        let exec = self.inner.exec.lock().expect("expression exec slot poisoned");
        match exec.as_ref() {
            Some(e) => e.state(),
            None => ExpressionState::from_u8(self.inner.state.load(Ordering::Acquire)),
        }
    }

    /// Error recorded for an aborted expression.
    pub fn error(&self) -> Option<Error> {
        let exec = self.inner.exec.lock().expect("expression exec slot poisoned");
        match exec.as_ref() {
            Some(e) => e.error(),
            None => self
                .inner
                .error
                .lock()
                .expect("expression error slot poisoned")
                .clone(),
        }
    }

    /// Block until evaluation finishes (or aborts). No-op before submission.
    pub fn wait(&self) {
        let exec = {
            let slot = self.inner.exec.lock().expect("expression exec slot poisoned");
            slot.clone()
        };
        if let Some(exec) = exec {
            exec.wait();
        }
    }

    /// Submit through the owning library.
    pub fn submit(&self) -> Result<()> {
        let library = self.inner.library.clone();
        library.submit(self)
    }

    /// Submit and wait; surfaces the recorded error on abort.
    pub fn submit_wait(&self) -> Result<()> {
        self.submit()?;
        self.wait();
        match self.state() {
            ExpressionState::Evaluated => Ok(()),
            _ => Err(self
                .error()
                .unwrap_or_else(|| Error::generic("expression aborted without recorded error"))),
        }
    }

    /// Declare that `pred` must complete before `succ` starts.
    pub fn dependency(&self, pred: NodeId, succ: NodeId) -> Result<()> {
        self.check_mutable()?;
        let nodes = self.inner.nodes.lock().expect("expression nodes poisoned");
        if pred.0 >= nodes.len() || succ.0 >= nodes.len() {
            return Err(Error::invalid_argument(
                "precedence endpoints must reference nodes of this expression",
            ));
        }
        if pred == succ {
            return Err(Error::invalid_argument(
                "a node cannot precede itself",
            ));
        }
        drop(nodes);
        self.inner
            .edges
            .lock()
            .expect("expression edges poisoned")
            .push((pred.0, succ.0));
        Ok(())
    }

    fn check_mutable(&self) -> Result<()> {
        if self.inner.frozen() {
            return Err(Error::invalid_state(
                "expression is frozen after submission",
            ));
        }
        Ok(())
    }

    fn push_node(&self, op: NodeOp, desc: Option<Descriptor>) -> Result<NodeId> {
        self.check_mutable()?;
        let mut nodes = self.inner.nodes.lock().expect("expression nodes poisoned");
        let id = nodes.len();
        nodes.push(NodeData { id, op, desc });
        Ok(NodeId(id))
    }

    // -- node constructors --------------------------------------------------

    /// Bulk ingress into a vector.
    pub fn make_data_write_vector(
        &self,
        v: &Vector,
        data: &DataVector,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::VectorDataWrite {
                v: v.clone(),
                data: data.clone(),
            },
            desc,
        )
    }

    /// Bulk egress from a vector.
    pub fn make_data_read_vector(
        &self,
        v: &Vector,
        data: &DataVector,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::VectorDataRead {
                v: v.clone(),
                data: data.clone(),
            },
            desc,
        )
    }

    /// Bulk ingress into a matrix.
    pub fn make_data_write_matrix(
        &self,
        m: &Matrix,
        data: &DataMatrix,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::MatrixDataWrite {
                m: m.clone(),
                data: data.clone(),
            },
            desc,
        )
    }

    /// Bulk egress from a matrix.
    pub fn make_data_read_matrix(
        &self,
        m: &Matrix,
        data: &DataMatrix,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::MatrixDataRead {
                m: m.clone(),
                data: data.clone(),
            },
            desc,
        )
    }

    /// `w<mask> = a ⊕ b` element-wise union.
    pub fn make_ewise_add_vector(
        &self,
        w: &Vector,
        mask: Option<&Vector>,
        op: &Arc<BinaryOp>,
        a: &Vector,
        b: &Vector,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::VectorEWiseAdd {
                w: w.clone(),
                mask: mask.cloned(),
                op: op.clone(),
                a: a.clone(),
                b: b.clone(),
            },
            desc,
        )
    }

    /// `w<mask> = a ⊗ b` element-wise intersection.
    pub fn make_ewise_mult_vector(
        &self,
        w: &Vector,
        mask: Option<&Vector>,
        op: &Arc<BinaryOp>,
        a: &Vector,
        b: &Vector,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::VectorEWiseMult {
                w: w.clone(),
                mask: mask.cloned(),
                op: op.clone(),
                a: a.clone(),
                b: b.clone(),
            },
            desc,
        )
    }

    /// Matrix element-wise union.
    pub fn make_ewise_add_matrix(
        &self,
        w: &Matrix,
        mask: Option<&Matrix>,
        op: &Arc<BinaryOp>,
        a: &Matrix,
        b: &Matrix,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::MatrixEWiseAdd {
                w: w.clone(),
                mask: mask.cloned(),
                op: op.clone(),
                a: a.clone(),
                b: b.clone(),
            },
            desc,
        )
    }

    /// Matrix element-wise intersection.
    pub fn make_ewise_mult_matrix(
        &self,
        w: &Matrix,
        mask: Option<&Matrix>,
        op: &Arc<BinaryOp>,
        a: &Matrix,
        b: &Matrix,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::MatrixEWiseMult {
                w: w.clone(),
                mask: mask.cloned(),
                op: op.clone(),
                a: a.clone(),
                b: b.clone(),
            },
            desc,
        )
    }

    /// `w<mask> = a × b` over the `(add_op, mul_op)` semiring.
    #[allow(clippy::too_many_arguments)]
    pub fn make_mxm(
        &self,
        w: &Matrix,
        mask: Option<&Matrix>,
        a: &Matrix,
        b: &Matrix,
        mul_op: &Arc<BinaryOp>,
        add_op: &Arc<BinaryOp>,
        init: Option<&Scalar>,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::MxM {
                w: w.clone(),
                mask: mask.cloned(),
                a: a.clone(),
                b: b.clone(),
                mul_op: mul_op.clone(),
                add_op: add_op.clone(),
                init: init.cloned(),
            },
            desc,
        )
    }

    /// `w<mask> = a × v`.
    #[allow(clippy::too_many_arguments)]
    pub fn make_mxv(
        &self,
        w: &Vector,
        mask: Option<&Vector>,
        a: &Matrix,
        v: &Vector,
        mul_op: &Arc<BinaryOp>,
        add_op: &Arc<BinaryOp>,
        select_op: Option<&Arc<SelectOp>>,
        init: Option<&Scalar>,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::MxV {
                w: w.clone(),
                mask: mask.cloned(),
                a: a.clone(),
                v: v.clone(),
                mul_op: mul_op.clone(),
                add_op: add_op.clone(),
                select_op: select_op.cloned(),
                init: init.cloned(),
            },
            desc,
        )
    }

    /// `w<mask> = v × a`.
    #[allow(clippy::too_many_arguments)]
    pub fn make_vxm(
        &self,
        w: &Vector,
        mask: Option<&Vector>,
        v: &Vector,
        a: &Matrix,
        mul_op: &Arc<BinaryOp>,
        add_op: &Arc<BinaryOp>,
        select_op: Option<&Arc<SelectOp>>,
        init: Option<&Scalar>,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::VxM {
                w: w.clone(),
                mask: mask.cloned(),
                v: v.clone(),
                a: a.clone(),
                mul_op: mul_op.clone(),
                add_op: add_op.clone(),
                select_op: select_op.cloned(),
                init: init.cloned(),
            },
            desc,
        )
    }

    /// Reduce all vector entries into a scalar.
    pub fn make_vector_reduce(
        &self,
        s: &Scalar,
        op: &Arc<BinaryOp>,
        v: &Vector,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::VectorReduce {
                s: s.clone(),
                op: op.clone(),
                v: v.clone(),
            },
            desc,
        )
    }

    /// Reduce all matrix entries (under a mask) into a scalar.
    pub fn make_matrix_reduce_scalar(
        &self,
        s: &Scalar,
        op: &Arc<BinaryOp>,
        m: &Matrix,
        mask: Option<&Matrix>,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::MatrixReduceScalar {
                s: s.clone(),
                op: op.clone(),
                m: m.clone(),
                mask: mask.cloned(),
            },
            desc,
        )
    }

    /// Broadcast a scalar into `w` under a mask.
    pub fn make_vector_assign(
        &self,
        w: &Vector,
        mask: Option<&Vector>,
        s: &Scalar,
        accum: Option<&Arc<BinaryOp>>,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::VectorAssign {
                w: w.clone(),
                mask: mask.cloned(),
                s: s.clone(),
                accum: accum.cloned(),
            },
            desc,
        )
    }

    /// `w<mask> = aᵀ`.
    pub fn make_transpose(
        &self,
        w: &Matrix,
        mask: Option<&Matrix>,
        a: &Matrix,
        accum: Option<&Arc<BinaryOp>>,
        desc: Option<Descriptor>,
    ) -> Result<NodeId> {
        self.push_node(
            NodeOp::Transpose {
                w: w.clone(),
                mask: mask.cloned(),
                a: a.clone(),
                accum: accum.cloned(),
            },
            desc,
        )
    }

    /// Keep the lower triangle (diagonal included).
    pub fn make_tril(&self, w: &Matrix, a: &Matrix, desc: Option<Descriptor>) -> Result<NodeId> {
        self.push_node(
            NodeOp::Tril {
                w: w.clone(),
                a: a.clone(),
            },
            desc,
        )
    }

    /// Keep the upper triangle (diagonal included).
    pub fn make_triu(&self, w: &Matrix, a: &Matrix, desc: Option<Descriptor>) -> Result<NodeId> {
        self.push_node(
            NodeOp::Triu {
                w: w.clone(),
                a: a.clone(),
            },
            desc,
        )
    }

    /// Materialise `v` in the dense vector format.
    pub fn make_to_dense(&self, w: &Vector, v: &Vector, desc: Option<Descriptor>) -> Result<NodeId> {
        self.push_node(
            NodeOp::VectorToDense {
                w: w.clone(),
                v: v.clone(),
            },
            desc,
        )
    }
}
