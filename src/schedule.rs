//! Expression manager: validation, ordering, lock planning, and submission.
//!
//! Submission runs synchronously on the caller's thread up to the final
//! dispatch: validate every node, order them topologically, collect lock
//! intents, compose the task graph out of each processor's sub-tasks
//! between `node_start`/`node_end` bookends, wire user edges and storage
//! hazards, acquire the logical locks in storage-id order, and hand the
//! graph to the pool. Any failure before dispatch marks the expression
//! Aborted without running a task.
//!
//! Beyond user-declared precedences, two nodes touching the same storage
//! with at least one writer get a hazard edge following the user-edge
//! topological order (node id as tie-break), so hazard wiring can never
//! introduce a cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{Descriptor, Param};
use crate::error::{Error, Result};
use crate::expression::{Expression, ExpressionState, NodeData, NodeOp};
use crate::ops::BinaryOp;
use crate::pool::{ExecShared, GraphBuilder};
use crate::processors::{processor_for, ExecCtx, SubtaskBuilder};
use crate::storage::StorageRef;
use crate::tensor::{Matrix, Scalar, Vector};
use crate::types::Type;
use crate::Library;

/// Storage lock intents of one expression, ordered by storage id.
struct LockPlan {
    entries: BTreeMap<u64, (StorageRef, bool)>,
}

impl LockPlan {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    fn add(&mut self, storage: StorageRef, write: bool) {
        self.entries
            .entry(storage.id())
            .and_modify(|(_, w)| *w |= write)
            .or_insert((storage, write));
    }

    /// Acquire in deterministic id order to avoid deadlock across
    /// concurrently submitted expressions.
    fn acquire_all(&self) {
        for (_, (storage, write)) in &self.entries {
            if *write {
                storage.access().lock_write();
            } else {
                storage.access().lock_read();
            }
        }
    }

    fn release_all(&self) {
        for (_, (storage, write)) in &self.entries {
            if *write {
                storage.access().unlock_write();
            } else {
                storage.access().unlock_read();
            }
        }
    }
}

/// Submit `expr` for evaluation.
pub(crate) fn submit(library: &Library, expr: &Expression) -> Result<()> {
    if expr.state() != ExpressionState::Default {
        return Err(Error::invalid_state("expression was already submitted"));
    }
    let inner = expr.inner.clone();
    let nodes = inner.nodes.lock().expect("expression nodes poisoned");
    let mut edges: Vec<(usize, usize)> = inner
        .edges
        .lock()
        .expect("expression edges poisoned")
        .clone();
    edges.sort_unstable();
    edges.dedup();
    let expr_desc = inner
        .desc
        .lock()
        .expect("expression desc poisoned")
        .clone()
        .unwrap_or_default();

    let abort = |err: Error| -> Error {
        inner.set_aborted(err.clone());
        err
    };

    // 1. Validate node arguments; failures abort before any task runs.
    let effective: Vec<Descriptor> = nodes
        .iter()
        .map(|n| match &n.desc {
            Some(d) => d.merged_over(&expr_desc),
            None => expr_desc.clone(),
        })
        .collect();
    for (node, eff) in nodes.iter().zip(&effective) {
        validate_node(node, eff).map_err(abort)?;
    }

    // 2. Topological order over user-declared edges.
    let order = topo_order(nodes.len(), &edges).map_err(abort)?;
    let mut position = vec![0usize; nodes.len()];
    for (pos, &id) in order.iter().enumerate() {
        position[id] = pos;
    }

    // 3. Lock intents, node by node in dependency order.
    let mut intents: Vec<Vec<(StorageRef, bool)>> = vec![Vec::new(); nodes.len()];
    for &id in &order {
        intents[id] = processor_for(&nodes[id].op).prepare(&nodes[id]);
    }
    let mut plan = LockPlan::new();
    for node_intents in &intents {
        for (storage, write) in node_intents {
            plan.add(storage.clone(), *write);
        }
    }

    // 4. Hazard edges between conflicting nodes, following topo order.
    for x in 0..nodes.len() {
        for y in (x + 1)..nodes.len() {
            if !conflicts(&intents[x], &intents[y]) {
                continue;
            }
            let (first, second) = if position[x] < position[y] { (x, y) } else { (y, x) };
            edges.push((first, second));
        }
    }
    edges.sort_unstable();
    edges.dedup();

    // 5. Compose the task graph.
    let exec = ExecShared::new();
    let mut graph = GraphBuilder::new();
    let mut bookends = vec![(0usize, 0usize); nodes.len()];
    for &id in &order {
        let node = &nodes[id];
        let eff = effective[id].clone();
        let start = graph.add_task(format!("{}:{}:start", node.op.name(), node.id), false, None);
        let end = graph.add_task(format!("{}:{}:end", node.op.name(), node.id), false, None);
        let profile = eff.is_param_set(Param::ProfileTime);
        let mut builder = SubtaskBuilder::new(&mut graph, start, end, exec.clone(), profile);
        let ctx = ExecCtx {
            env: library.env().clone(),
            eff,
        };
        processor_for(&node.op)
            .execute(&ctx, node, &mut builder)
            .map_err(abort)?;
        graph.precede(start, end);
        bookends[id] = (start, end);
    }
    for &(pred, succ) in &edges {
        graph.precede(bookends[pred].1, bookends[succ].0);
    }
    let sink = graph.add_task("expression:done", false, None);
    for &(_, end) in &bookends {
        graph.precede(end, sink);
    }

    let task_count = graph.task_count();
    drop(nodes);

    // 6. Locks are taken on the submitting thread in storage-id order:
    // submission order establishes the happens-before between expressions.
    plan.acquire_all();

    // 7. Epilogue: release locks, run finalize hooks, log the outcome.
    // It runs exactly once when the graph drains, possibly on a worker.
    // Holds only a weak expression reference: a strong one would run the
    // expression's graph-waiting drop from inside graph completion.
    let inner_done = Arc::downgrade(&inner);
    exec.set_epilogue(Box::new(move |exec: &ExecShared| {
        plan.release_all();
        if let Some(inner) = inner_done.upgrade() {
            if let Ok(nodes) = inner.nodes.lock() {
                for node in nodes.iter() {
                    processor_for(&node.op).finalize(node);
                }
            }
        }
        debug!(
            error = exec.error().map(|e| e.to_string()),
            "expression drained"
        );
    }));

    inner.set_submitted(exec.clone());
    debug!(tasks = task_count, "expression submitted");
    let run_graph = graph.build(exec, library.pool_shared());
    library.pool().submit(run_graph);
    Ok(())
}

fn conflicts(a: &[(StorageRef, bool)], b: &[(StorageRef, bool)]) -> bool {
    for (sa, wa) in a {
        for (sb, wb) in b {
            if sa.id() == sb.id() && (*wa || *wb) {
                return true;
            }
        }
    }
    false
}

/// Kahn's algorithm with node id as the tie-break; a cycle is an error.
fn topo_order(n: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>> {
    let mut indegree = vec![0usize; n];
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(p, s) in edges {
        succs[p].push(s);
        indegree[s] += 1;
    }
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(&next) = ready.iter().min() {
        ready.retain(|&i| i != next);
        order.push(next);
        for &s in &succs[next] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.push(s);
            }
        }
    }
    if order.len() != n {
        return Err(Error::invalid_state(
            "expression precedence edges form a cycle",
        ));
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn op_arg_ok(op_ty: &Arc<Type>, tensor_ty: &Arc<Type>) -> bool {
    op_ty == tensor_ty || !tensor_ty.has_values()
}

fn check_binary_op(
    op: &BinaryOp,
    a: &Arc<Type>,
    b: &Arc<Type>,
    out: &Arc<Type>,
) -> Result<()> {
    if !op_arg_ok(op.arg_a(), a) || !op_arg_ok(op.arg_b(), b) || !op_arg_ok(op.result(), out) {
        return Err(Error::type_mismatch(format!(
            "operator `{}` signature ({}, {}) -> {} disagrees with tensor types ({}, {}) -> {}",
            op.source(),
            op.arg_a().name(),
            op.arg_b().name(),
            op.result().name(),
            a.name(),
            b.name(),
            out.name()
        )));
    }
    Ok(())
}

fn check_vector_shapes(w: &Vector, others: &[(&str, usize)]) -> Result<()> {
    for (what, nrows) in others {
        if *nrows != w.nrows() {
            return Err(Error::invalid_argument(format!(
                "{what} length {nrows} does not match destination length {}",
                w.nrows()
            )));
        }
    }
    Ok(())
}

fn check_matrix_shape(what: &str, m: &Matrix, nrows: usize, ncols: usize) -> Result<()> {
    if m.nrows() != nrows || m.ncols() != ncols {
        return Err(Error::invalid_argument(format!(
            "{what} shape {}x{} does not match required {nrows}x{ncols}",
            m.nrows(),
            m.ncols()
        )));
    }
    Ok(())
}

fn check_complement(eff: &Descriptor, has_mask: bool) -> Result<()> {
    if eff.is_param_set(Param::MaskComplement) && !has_mask {
        return Err(Error::invalid_state(
            "MaskComplement requires a mask argument",
        ));
    }
    Ok(())
}

fn check_scalar_type(s: &Scalar, ty: &Arc<Type>) -> Result<()> {
    if s.element_type() != ty && ty.has_values() {
        return Err(Error::type_mismatch(format!(
            "scalar type {} disagrees with tensor type {}",
            s.element_type().name(),
            ty.name()
        )));
    }
    Ok(())
}

fn validate_node(node: &NodeData, eff: &Descriptor) -> Result<()> {
    match &node.op {
        NodeOp::VectorDataWrite { .. } | NodeOp::VectorDataRead { .. } => Ok(()),
        NodeOp::MatrixDataWrite { .. } | NodeOp::MatrixDataRead { .. } => Ok(()),
        NodeOp::VectorEWiseAdd { w, mask, op, a, b }
        | NodeOp::VectorEWiseMult { w, mask, op, a, b } => {
            check_complement(eff, mask.is_some())?;
            let mut shapes = vec![("operand a", a.nrows()), ("operand b", b.nrows())];
            if let Some(m) = mask {
                shapes.push(("mask", m.nrows()));
            }
            check_vector_shapes(w, &shapes)?;
            check_binary_op(op, a.element_type(), b.element_type(), w.element_type())
        }
        NodeOp::MatrixEWiseAdd { w, mask, op, a, b }
        | NodeOp::MatrixEWiseMult { w, mask, op, a, b } => {
            check_complement(eff, mask.is_some())?;
            check_matrix_shape("operand a", a, w.nrows(), w.ncols())?;
            check_matrix_shape("operand b", b, w.nrows(), w.ncols())?;
            if let Some(m) = mask {
                check_matrix_shape("mask", m, w.nrows(), w.ncols())?;
            }
            check_binary_op(op, a.element_type(), b.element_type(), w.element_type())
        }
        NodeOp::MxM {
            w,
            mask,
            a,
            b,
            mul_op,
            add_op,
            init,
        } => {
            check_complement(eff, mask.is_some())?;
            if a.ncols() != b.nrows() {
                return Err(Error::invalid_argument(format!(
                    "mxm inner dimensions disagree: a is {}x{}, b is {}x{}",
                    a.nrows(),
                    a.ncols(),
                    b.nrows(),
                    b.ncols()
                )));
            }
            check_matrix_shape("destination", w, a.nrows(), b.ncols())?;
            if let Some(m) = mask {
                check_matrix_shape("mask", m, w.nrows(), w.ncols())?;
            }
            check_binary_op(mul_op, a.element_type(), b.element_type(), w.element_type())?;
            check_binary_op(add_op, w.element_type(), w.element_type(), w.element_type())?;
            if let Some(s) = init {
                check_scalar_type(s, w.element_type())?;
            }
            Ok(())
        }
        NodeOp::MxV {
            w,
            mask,
            a,
            v,
            mul_op,
            add_op,
            select_op,
            init,
        } => {
            check_complement(eff, mask.is_some())?;
            if a.ncols() != v.nrows() {
                return Err(Error::invalid_argument(format!(
                    "mxv requires a.ncols == v.nrows, got {} and {}",
                    a.ncols(),
                    v.nrows()
                )));
            }
            let mut shapes = vec![("matrix row count", a.nrows())];
            if let Some(m) = mask {
                shapes.push(("mask", m.nrows()));
            }
            check_vector_shapes(w, &shapes)?;
            check_binary_op(mul_op, a.element_type(), v.element_type(), w.element_type())?;
            check_binary_op(add_op, w.element_type(), w.element_type(), w.element_type())?;
            if let Some(sel) = select_op {
                if !op_arg_ok(sel.arg(), v.element_type()) {
                    return Err(Error::type_mismatch(
                        "select operator argument disagrees with source vector type",
                    ));
                }
            }
            if let Some(s) = init {
                check_scalar_type(s, w.element_type())?;
            }
            Ok(())
        }
        NodeOp::VxM {
            w,
            mask,
            v,
            a,
            mul_op,
            add_op,
            select_op,
            init,
        } => {
            check_complement(eff, mask.is_some())?;
            if v.nrows() != a.nrows() {
                return Err(Error::invalid_argument(format!(
                    "vxm requires v.nrows == a.nrows, got {} and {}",
                    v.nrows(),
                    a.nrows()
                )));
            }
            let mut shapes = vec![("matrix column count", a.ncols())];
            if let Some(m) = mask {
                shapes.push(("mask", m.nrows()));
            }
            check_vector_shapes(w, &shapes)?;
            check_binary_op(mul_op, v.element_type(), a.element_type(), w.element_type())?;
            check_binary_op(add_op, w.element_type(), w.element_type(), w.element_type())?;
            if let Some(sel) = select_op {
                if !op_arg_ok(sel.arg(), v.element_type()) {
                    return Err(Error::type_mismatch(
                        "select operator argument disagrees with source vector type",
                    ));
                }
            }
            if let Some(s) = init {
                check_scalar_type(s, w.element_type())?;
            }
            Ok(())
        }
        NodeOp::VectorReduce { s, op, v } => {
            check_binary_op(op, v.element_type(), v.element_type(), v.element_type())?;
            check_scalar_type(s, v.element_type())
        }
        NodeOp::MatrixReduceScalar { s, op, m, mask } => {
            check_complement(eff, mask.is_some())?;
            if let Some(mk) = mask {
                check_matrix_shape("mask", mk, m.nrows(), m.ncols())?;
            }
            check_binary_op(op, m.element_type(), m.element_type(), m.element_type())?;
            check_scalar_type(s, m.element_type())
        }
        NodeOp::VectorAssign { w, mask, s, accum } => {
            check_complement(eff, mask.is_some())?;
            if let Some(m) = mask {
                check_vector_shapes(w, &[("mask", m.nrows())])?;
            }
            check_scalar_type(s, w.element_type())?;
            if let Some(accum) = accum {
                check_binary_op(accum, w.element_type(), w.element_type(), w.element_type())?;
            }
            Ok(())
        }
        NodeOp::Transpose { w, mask, a, accum } => {
            check_complement(eff, mask.is_some())?;
            check_matrix_shape("destination", w, a.ncols(), a.nrows())?;
            if let Some(m) = mask {
                check_matrix_shape("mask", m, w.nrows(), w.ncols())?;
            }
            if a.element_type() != w.element_type() {
                return Err(Error::type_mismatch(
                    "transpose requires equal source and destination types",
                ));
            }
            if let Some(accum) = accum {
                check_binary_op(accum, w.element_type(), w.element_type(), w.element_type())?;
            }
            Ok(())
        }
        NodeOp::Tril { w, a } | NodeOp::Triu { w, a } => {
            check_matrix_shape("destination", w, a.nrows(), a.ncols())?;
            if a.element_type() != w.element_type() {
                return Err(Error::type_mismatch(
                    "triangular extraction requires equal source and destination types",
                ));
            }
            Ok(())
        }
        NodeOp::VectorToDense { w, v } => {
            check_vector_shapes(w, &[("source", v.nrows())])?;
            if v.element_type() != w.element_type() {
                return Err(Error::type_mismatch(
                    "to-dense requires equal source and destination types",
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topo_orders_by_id_among_ready() {
        let order = topo_order(4, &[(2, 0), (0, 1)]).unwrap();
        assert_eq!(order, vec![2, 0, 1, 3]);
    }

    #[test]
    fn cycle_is_detected() {
        let err = topo_order(3, &[(0, 1), (1, 2), (2, 0)]).unwrap_err();
        assert_eq!(err.status(), crate::error::Status::InvalidState);
    }
}
