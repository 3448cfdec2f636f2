//! cafe-scheduler: DAG traversal and task lifecycle driver.
//!
//! A single controller owns the traversal state (`to_visit`/`to_execute`/
//! in-flight count); executors run concurrently and report back over an
//! mpsc channel rather than a callback, so the controller never shares
//! mutable state with an in-flight execution. Grounded directly on
//! `caf2/graph.py::traverse_async`'s action triad, reshaped into an
//! explicit priority-ordered loop over the three action checks instead of
//! a generator. Concurrent execution dispatch (`tokio::spawn` per
//! ready task, results drained from a channel) plays the same role as
//! `turborepo-lib`'s `Visitor::visit` running its task futures against a
//! `FuturesUnordered` and folding results back into the visitor state.

mod action;
mod error;
mod local;
mod remote;

pub use action::{Action, Priority, DEFAULT_PRIORITY};
pub use error::SchedulerError;
pub use local::{Executor, LocalScheduler, RunSummary};
pub use remote::RemoteScheduler;
