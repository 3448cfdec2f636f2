//! cafe-future: the `Future`/`Task`/`Template`/`Indexor` node model.
//!
//! Grounded on `caf2/caf.py`'s `Future` base class and its three
//! subclasses, kept unchanged in semantics (ready-before-done, dependents
//! notified before done-callbacks, single-assignment results) but
//! implemented as an arena of ids rather than a graph of reference-counted
//! objects, following `turborepo-engine`'s `TaskNode`/`Engine<Building>`
//! arena style. Notification is delivered through an explicit queue
//! (`set_result`'s internal work list) instead of recursive callback
//! chains, so a long dependency run cannot overflow the stack.

mod template;

use std::collections::{HashMap, HashSet, VecDeque};

pub use template::{resolve as resolve_indexor, substitute as substitute_template, IndexKey, TemplateValue};

use cafe_hash::Hash;
use serde_json::Value;
use thiserror::Error;

/// Stable id of a node in the arena. Indexes are never reused, so an id
/// that outlives the node it names simply becomes invalid rather than
/// aliasing a different node.
pub type FutureId = u32;

#[derive(Debug, Error)]
pub enum FutureError {
    #[error("future {0} is not ready")]
    NotReady(FutureId),
    #[error("future {0} is already done")]
    AlreadyDone(FutureId),
}

enum FutureKind {
    Task { args: Vec<FutureId> },
    Template { jsonstr: String, futures: HashMap<String, FutureId> },
    Indexor { task: FutureId, keys: Vec<IndexKey> },
}

struct Node {
    kind: FutureKind,
    hashid: String,
    pending: HashSet<FutureId>,
    dependents: HashSet<FutureId>,
    result: Option<Value>,
}

/// The DAG of in-flight and resolved futures for one session.
#[derive(Default)]
pub struct Arena {
    nodes: Vec<Node>,
    /// Tasks that just became ready and are waiting for the session to
    /// move them from `pending` into its `waiting` queue.
    ready_tasks: VecDeque<FutureId>,
    /// Maps an inner future a task's rule chained onto, to the outer task
    /// awaiting its result. Mirrors `Task.run`'s
    /// `result.add_done_callback(lambda fut: self.set_result(fut.result()))`.
    chains: HashMap<FutureId, FutureId>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(&self, id: FutureId) -> bool {
        self.nodes[id as usize].pending.is_empty()
    }

    pub fn done(&self, id: FutureId) -> bool {
        self.nodes[id as usize].result.is_some()
    }

    pub fn result(&self, id: FutureId) -> Option<&Value> {
        self.nodes[id as usize].result.as_ref()
    }

    pub fn hashid(&self, id: FutureId) -> &str {
        &self.nodes[id as usize].hashid
    }

    pub fn task_args(&self, id: FutureId) -> Option<&[FutureId]> {
        match &self.nodes[id as usize].kind {
            FutureKind::Task { args } => Some(args),
            _ => None,
        }
    }

    /// Drains the ids of tasks that have become ready since the last call.
    pub fn take_ready_tasks(&mut self) -> Vec<FutureId> {
        self.ready_tasks.drain(..).collect()
    }

    fn push_node(&mut self, kind: FutureKind, hashid: String, deps: &[FutureId]) -> FutureId {
        let id = self.nodes.len() as FutureId;
        let pending: HashSet<FutureId> = deps.iter().copied().filter(|d| !self.done(*d)).collect();
        self.nodes.push(Node {
            kind,
            hashid,
            pending: pending.clone(),
            dependents: HashSet::new(),
            result: None,
        });
        for dep in pending {
            self.nodes[dep as usize].dependents.insert(id);
        }
        id
    }

    /// Registers a task node for `hash` depending on `args`. Tasks with no
    /// pending args are immediately queued as ready, matching
    /// `Session.create_task` registering a ready-callback right away.
    pub fn new_task(&mut self, hash: Hash, args: Vec<FutureId>) -> FutureId {
        let hashid = hash.to_string();
        let id = self.push_node(FutureKind::Task { args: args.clone() }, hashid, &args);
        if self.ready(id) {
            self.ready_tasks.push_back(id);
        }
        id
    }

    /// Registers a `Template` over `jsonstr` (already canonicalized, with
    /// `{"hashid": ...}` markers in place of embedded futures) and resolves
    /// it immediately if every referenced future is already done.
    pub fn new_template(&mut self, jsonstr: String, futures: HashMap<String, FutureId>) -> FutureId {
        let hashid = format!("{{}}{}", template::hash_jsonstr(&jsonstr));
        let deps: Vec<FutureId> = futures.values().copied().collect();
        let id = self.push_node(
            FutureKind::Template { jsonstr, futures },
            hashid,
            &deps,
        );
        if self.ready(id) {
            let value = self.substitute(id);
            self.set_result(id, value);
        }
        id
    }

    /// Registers an `Indexor` extracting `keys` out of `task`'s eventual
    /// result, resolving immediately if `task` is already done.
    pub fn new_indexor(&mut self, task: FutureId, keys: Vec<IndexKey>) -> FutureId {
        let hashid = format!(
            "@{}/{}",
            self.hashid(task),
            keys.iter().map(IndexKey::to_string).collect::<Vec<_>>().join("/")
        );
        let id = self.push_node(FutureKind::Indexor { task, keys }, hashid, &[task]);
        if self.ready(id) {
            let value = self.resolve_indexor(id);
            self.set_result(id, value);
        }
        id
    }

    fn substitute(&self, id: FutureId) -> Value {
        let FutureKind::Template { jsonstr, futures } = &self.nodes[id as usize].kind else {
            unreachable!("substitute called on a non-template node")
        };
        let marked: Value = serde_json::from_str(jsonstr).expect("template jsonstr is valid JSON");
        template::substitute(&marked, futures, self)
    }

    fn resolve_indexor(&self, id: FutureId) -> Value {
        let FutureKind::Indexor { task, keys } = &self.nodes[id as usize].kind else {
            unreachable!("resolve_indexor called on a non-indexor node")
        };
        let base = self.result(*task).expect("indexed task must be done");
        template::resolve(base, keys).expect("indexor path resolves against its task's result")
    }

    /// Sets `id`'s result and propagates readiness to its dependents and,
    /// if `id` is chained to an outer task, to that task as well. Delivery
    /// is iterative (a work queue, not recursion) so a long chain of
    /// templates/indexors cannot overflow the stack.
    pub fn set_result(&mut self, id: FutureId, value: Value) {
        let mut queue = VecDeque::new();
        queue.push_back((id, value));
        while let Some((id, value)) = queue.pop_front() {
            self.set_result_one(id, value, &mut queue);
        }
    }

    fn set_result_one(&mut self, id: FutureId, value: Value, queue: &mut VecDeque<(FutureId, Value)>) {
        debug_assert!(self.ready(id), "future {id} set_result before ready");
        debug_assert!(!self.done(id), "future {id} double set_result");
        self.nodes[id as usize].result = Some(value.clone());
        tracing::debug!(hashid = %self.hashid(id), "future done");
        let dependents: Vec<FutureId> = self.nodes[id as usize].dependents.drain().collect();
        for dep in dependents {
            self.dep_done(dep, id, queue);
        }
        if let Some(outer) = self.chains.remove(&id) {
            queue.push_back((outer, value));
        }
    }

    fn dep_done(&mut self, dep: FutureId, completed: FutureId, queue: &mut VecDeque<(FutureId, Value)>) {
        self.nodes[dep as usize].pending.remove(&completed);
        if !self.ready(dep) {
            return;
        }
        tracing::debug!(hashid = %self.hashid(dep), "future ready");
        match &self.nodes[dep as usize].kind {
            FutureKind::Template { .. } => {
                let value = self.substitute(dep);
                queue.push_back((dep, value));
            }
            FutureKind::Indexor { .. } => {
                let value = self.resolve_indexor(dep);
                queue.push_back((dep, value));
            }
            FutureKind::Task { .. } => self.ready_tasks.push_back(dep),
        }
    }

    /// Completes a task's run with either a direct value or a chain onto
    /// another future's eventual result (the latter is `Task.run`'s
    /// "the rule's return value was itself a pending Future" branch).
    pub fn complete_task(&mut self, id: FutureId, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Value(value) => self.set_result(id, value),
            TaskOutcome::Chained(inner) => {
                if self.done(inner) {
                    let value = self.result(inner).cloned().expect("checked done above");
                    self.set_result(id, value);
                } else {
                    self.chains.insert(inner, id);
                }
            }
        }
    }

    /// `wrap_input`: always yields a `Template`, even over a value with no
    /// embedded futures (where it resolves immediately — the "trivially
    /// done Future-equivalent" case).
    pub fn wrap_input(&mut self, value: TemplateValue) -> FutureId {
        if let TemplateValue::Future(id) = value {
            return id;
        }
        let (jsonstr, futures) = value.parse(self);
        self.new_template(jsonstr, futures)
    }

    /// `wrap_output`: a value with embedded futures becomes a `Template`;
    /// otherwise the plain value is returned directly, with no Future
    /// wrapper at all.
    pub fn wrap_output(&mut self, value: TemplateValue) -> TaskOutcome {
        if let TemplateValue::Future(id) = value {
            return TaskOutcome::Chained(id);
        }
        let (jsonstr, futures) = value.parse(self);
        if futures.is_empty() {
            TaskOutcome::Value(value.into_plain_value())
        } else {
            TaskOutcome::Chained(self.new_template(jsonstr, futures))
        }
    }
}

/// The outcome of running a task's rule: a concrete value, or a hand-off
/// onto another future (the rule returned a `Task`/`Template`/`Indexor`).
pub enum TaskOutcome {
    Value(Value),
    Chained(FutureId),
}
