//! Worker pool and task-graph runtime.
//!
//! A submitted expression becomes one task graph: tasks with dependency
//! counters and successor lists. Workers pull runnable tasks from a shared
//! channel; completing a task decrements its successors' counters and
//! enqueues the ones that reach zero. The last task to finish triggers the
//! graph's epilogue exactly once (lock release, final state transition,
//! waiter wake-up).
//!
//! A task failure records the first error on the shared execution state and
//! flips the cancel flag; queued tasks still drain through the graph so the
//! counters stay consistent, but cancelled actions skip their work.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::ExpressionState;

pub(crate) type TaskId = usize;

pub(crate) type TaskAction = Box<dyn FnOnce() -> Result<()> + Send>;
type Epilogue = Box<dyn FnOnce(&ExecShared) + Send>;

/// Shared execution state of one submitted expression.
pub(crate) struct ExecShared {
    state: AtomicU8,
    cancelled: AtomicBool,
    error: Mutex<Option<Error>>,
    done: Mutex<bool>,
    done_cv: Condvar,
    epilogue: Mutex<Option<Epilogue>>,
}

impl ExecShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ExpressionState::Submitted as u8),
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            epilogue: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ExpressionState {
        ExpressionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record the first failure and start cancelling the rest of the graph.
    pub fn record_failure(&self, err: Error) {
        if err.is_critical() {
            error!(status = %err.status(), "critical task failure: {}", err.message());
        } else {
            debug!(status = %err.status(), "task failure: {}", err.message());
        }
        let mut slot = self.error.lock().expect("exec error slot poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn error(&self) -> Option<Error> {
        self.error.lock().expect("exec error slot poisoned").clone()
    }

    pub(crate) fn set_epilogue(&self, f: Epilogue) {
        *self.epilogue.lock().expect("exec epilogue poisoned") = Some(f);
    }

    /// Run by the graph's last finishing task.
    fn complete(&self) {
        let epilogue = self
            .epilogue
            .lock()
            .expect("exec epilogue poisoned")
            .take();
        if let Some(f) = epilogue {
            f(self);
        }
        let next = if self.error().is_some() {
            ExpressionState::Aborted
        } else {
            ExpressionState::Evaluated
        };
        self.state.store(next as u8, Ordering::Release);
        let mut done = self.done.lock().expect("exec done flag poisoned");
        *done = true;
        self.done_cv.notify_all();
    }

    /// Mark the expression aborted before any task ran.
    pub(crate) fn abort_early(&self, err: Error) {
        self.record_failure(err);
        self.state
            .store(ExpressionState::Aborted as u8, Ordering::Release);
        let mut done = self.done.lock().expect("exec done flag poisoned");
        *done = true;
        self.done_cv.notify_all();
    }

    /// Block until the graph's sink has finished.
    pub fn wait(&self) {
        let mut done = self.done.lock().expect("exec done flag poisoned");
        while !*done {
            done = self.done_cv.wait(done).expect("exec done flag poisoned");
        }
    }
}

struct BuildTask {
    label: String,
    profile: bool,
    action: Option<TaskAction>,
    succs: Vec<TaskId>,
    preds: usize,
}

/// Mutable task graph under construction, frozen by [`GraphBuilder::build`].
pub(crate) struct GraphBuilder {
    tasks: Vec<BuildTask>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Add a task; `action` of `None` is a pure fence.
    pub fn add_task(
        &mut self,
        label: impl Into<String>,
        profile: bool,
        action: Option<TaskAction>,
    ) -> TaskId {
        let id = self.tasks.len();
        self.tasks.push(BuildTask {
            label: label.into(),
            profile,
            action,
            succs: Vec::new(),
            preds: 0,
        });
        id
    }

    /// Require that `before` completes before `after` starts.
    pub fn precede(&mut self, before: TaskId, after: TaskId) {
        debug_assert!(before < self.tasks.len() && after < self.tasks.len());
        debug_assert_ne!(before, after);
        if self.tasks[before].succs.contains(&after) {
            return;
        }
        self.tasks[before].succs.push(after);
        self.tasks[after].preds += 1;
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn build(self, exec: Arc<ExecShared>, pool: Arc<PoolShared>) -> Arc<RunGraph> {
        let tasks: Vec<RunTask> = self
            .tasks
            .into_iter()
            .map(|t| RunTask {
                label: t.label,
                profile: t.profile,
                action: Mutex::new(t.action),
                pending: AtomicUsize::new(t.preds),
                succs: t.succs,
            })
            .collect();
        let remaining = tasks.len();
        Arc::new(RunGraph {
            tasks,
            remaining: AtomicUsize::new(remaining),
            exec,
            pool,
        })
    }
}

struct RunTask {
    label: String,
    profile: bool,
    action: Mutex<Option<TaskAction>>,
    pending: AtomicUsize,
    succs: Vec<TaskId>,
}

/// Frozen task graph being executed by the pool.
pub(crate) struct RunGraph {
    tasks: Vec<RunTask>,
    remaining: AtomicUsize,
    exec: Arc<ExecShared>,
    pool: Arc<PoolShared>,
}

impl RunGraph {
    fn run_task(self: &Arc<Self>, id: TaskId, tx: &Sender<Message>) {
        let task = &self.tasks[id];
        let action = task.action.lock().expect("task action poisoned").take();
        if let Some(action) = action {
            let started = Instant::now();
            match action() {
                Ok(()) => {
                    if task.profile {
                        info!(task = %task.label, elapsed = ?started.elapsed(), "task done");
                    }
                }
                Err(err) => self.exec.record_failure(err),
            }
        }
        for &succ in &task.succs {
            if self.tasks[succ].pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = tx.send(Message::Run(self.clone(), succ));
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.exec.complete();
            self.pool.graph_finished();
        }
    }
}

enum Message {
    Run(Arc<RunGraph>, TaskId),
    Shutdown,
}

/// Bookkeeping shared between the pool handle and running graphs.
pub(crate) struct PoolShared {
    active: Mutex<usize>,
    idle_cv: Condvar,
}

impl PoolShared {
    fn graph_started(&self) {
        *self.active.lock().expect("pool active count poisoned") += 1;
    }

    fn graph_finished(&self) {
        let mut n = self.active.lock().expect("pool active count poisoned");
        *n -= 1;
        if *n == 0 {
            self.idle_cv.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut n = self.active.lock().expect("pool active count poisoned");
        while *n > 0 {
            n = self.idle_cv.wait(n).expect("pool active count poisoned");
        }
    }
}

/// The process-wide worker pool of one library instance.
pub(crate) struct Pool {
    tx: Sender<Message>,
    shared: Arc<PoolShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Pool {
    pub fn new(workers_count: usize) -> Self {
        debug_assert!(workers_count > 0);
        let (tx, rx): (Sender<Message>, Receiver<Message>) = unbounded();
        let shared = Arc::new(PoolShared {
            active: Mutex::new(0),
            idle_cv: Condvar::new(),
        });
        let workers = (0..workers_count)
            .map(|i| {
                let rx = rx.clone();
                let tx = tx.clone();
                std::thread::Builder::new()
                    .name(format!("sparla-worker-{i}"))
                    .spawn(move || worker_loop(rx, tx))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tx,
            shared,
            workers,
        }
    }

    pub fn shared(&self) -> Arc<PoolShared> {
        self.shared.clone()
    }

    /// Enqueue every task of the graph that is ready to run.
    pub fn submit(&self, graph: Arc<RunGraph>) {
        self.shared.graph_started();
        let ready: Vec<TaskId> = graph
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.pending.load(Ordering::Acquire) == 0)
            .map(|(i, _)| i)
            .collect();
        for id in ready {
            let _ = self.tx.send(Message::Run(graph.clone(), id));
        }
    }
}

fn worker_loop(rx: Receiver<Message>, tx: Sender<Message>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Run(graph, id) => graph.run_task(id, &tx),
            Message::Shutdown => break,
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Drain running graphs first so no successor lands after a worker
        // has already seen its shutdown message.
        self.shared.wait_idle();
        for _ in &self.workers {
            let _ = self.tx.send(Message::Shutdown);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn run_graph<F>(pool: &Pool, build: F) -> Arc<ExecShared>
    where
        F: FnOnce(&mut GraphBuilder, Arc<ExecShared>),
    {
        let exec = ExecShared::new();
        let mut builder = GraphBuilder::new();
        build(&mut builder, exec.clone());
        let graph = builder.build(exec.clone(), pool.shared());
        pool.submit(graph);
        exec.wait();
        exec
    }

    #[test]
    fn tasks_respect_dependencies() {
        let pool = Pool::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let exec = run_graph(&pool, |b, _| {
            let mark = |order: &Arc<Mutex<Vec<u32>>>, v: u32| -> TaskAction {
                let order = order.clone();
                Box::new(move || {
                    order.lock().unwrap().push(v);
                    Ok(())
                })
            };
            let t1 = b.add_task("t1", false, Some(mark(&order, 1)));
            let t2 = b.add_task("t2", false, Some(mark(&order, 2)));
            let t3 = b.add_task("t3", false, Some(mark(&order, 3)));
            b.precede(t1, t2);
            b.precede(t2, t3);
        });

        assert_eq!(exec.state(), ExpressionState::Evaluated);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn failure_cancels_downstream_work() {
        let pool = Pool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));

        let exec = run_graph(&pool, |b, exec| {
            let fail = b.add_task(
                "fail",
                false,
                Some(Box::new(|| Err(Error::invalid_state("boom")))),
            );
            let ran2 = ran.clone();
            let exec2 = exec;
            let skip = b.add_task(
                "skippable",
                false,
                Some(Box::new(move || {
                    if !exec2.cancelled() {
                        ran2.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                })),
            );
            b.precede(fail, skip);
        });

        assert_eq!(exec.state(), ExpressionState::Aborted);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(exec.error().unwrap().message().contains("boom"));
    }

    #[test]
    fn epilogue_runs_once_after_all_tasks() {
        let pool = Pool::new(2);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let exec = run_graph(&pool, move |b, exec| {
            exec.set_epilogue(Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }));
            for i in 0..8 {
                b.add_task(format!("t{i}"), false, Some(Box::new(|| Ok(()))));
            }
        });

        assert_eq!(exec.state(), ExpressionState::Evaluated);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fence_tasks_are_pure() {
        let pool = Pool::new(2);
        let exec = run_graph(&pool, |b, _| {
            let start = b.add_task("node_start", false, None);
            let work = b.add_task("work", false, Some(Box::new(|| Ok(()))));
            let end = b.add_task("node_end", false, None);
            b.precede(start, work);
            b.precede(work, end);
        });
        assert_eq!(exec.state(), ExpressionState::Evaluated);
    }
}
