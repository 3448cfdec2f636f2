//! cafe-session: scoped session activation and rule-driven task creation.
//!
//! Grounded on `caf2/caf.py`'s `Session`/`Rule`: one active session at a
//! time, task creation deduplicated by hash, a `pending`/`waiting` pair
//! draining synchronously inside `eval`. The scoped-activation invariant
//! (`Session.__enter__`/`__exit__`) becomes an RAII guard over a
//! process-wide mutex rather than implicit thread-local state, so it is
//! released on every exit path, panics included.

use std::{
    collections::{HashMap, VecDeque, HashSet},
    rc::Rc,
    sync::Mutex,
};

use cafe_future::{Arena, FutureId, TemplateValue};
use cafe_hash::Hash;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active on this process")]
    AlreadyActive,
}

static ACTIVE: Mutex<bool> = Mutex::new(false);

/// A named rule: a pure function from resolved argument values to the
/// value a task built from it should produce. For a command-based task
/// this is a deterministic builder of the `{command, inputs, ...}`
/// definition object (§6's Task JSON v2 schema); the command it names is
/// only ever executed later, by the scheduler's executor.
#[derive(Clone)]
pub struct Rule {
    fullname: String,
    func: Rc<dyn Fn(&[Value]) -> TemplateValue>,
}

impl Rule {
    pub fn new(fullname: impl Into<String>, func: impl Fn(&[Value]) -> TemplateValue + 'static) -> Self {
        Self {
            fullname: fullname.into(),
            func: Rc::new(func),
        }
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

pub struct Session {
    arena: Arena,
    tasks: HashMap<Hash, FutureId>,
    pending: HashSet<FutureId>,
    waiting: VecDeque<FutureId>,
    rules: HashMap<FutureId, Rc<dyn Fn(&[Value]) -> TemplateValue>>,
}

impl Session {
    fn new() -> Self {
        Self {
            arena: Arena::new(),
            tasks: HashMap::new(),
            pending: HashSet::new(),
            waiting: VecDeque::new(),
            rules: HashMap::new(),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Applies `rule` to `args`, returning the existing task if an
    /// identically-hashed one already exists in this session. The hash is
    /// `sha1(canonical_json([rule.fullname, *(arg.hashid)]))`, exactly
    /// `Session.create_task`'s `hash_obj`.
    pub fn create_task(&mut self, rule: &Rule, args: Vec<TemplateValue>) -> FutureId {
        let arg_ids: Vec<FutureId> = args.into_iter().map(|a| self.arena.wrap_input(a)).collect();

        let mut hash_obj = vec![Value::String(rule.fullname.clone())];
        hash_obj.extend(arg_ids.iter().map(|id| Value::String(self.arena.hashid(*id).to_string())));
        let hash = cafe_hash::hash_json(&Value::Array(hash_obj));

        if let Some(&existing) = self.tasks.get(&hash) {
            return existing;
        }

        let id = self.arena.new_task(hash, arg_ids);
        self.tasks.insert(hash, id);
        self.pending.insert(id);
        self.rules.insert(id, Rc::clone(&rule.func));
        tracing::info!(hashid = %self.arena.hashid(id), rule = %rule.fullname, "task created");
        self.drain_ready();
        id
    }

    /// Normalizes `value` to a future, runs every task made runnable by it
    /// to completion (single task at a time — the default scheduler mode),
    /// and returns the settled result.
    pub fn eval(&mut self, value: TemplateValue) -> Value {
        let id = self.arena.wrap_input(value);
        self.drain_ready();
        while let Some(task_id) = self.waiting.pop_front() {
            self.run_task(task_id);
        }
        self.arena
            .result(id)
            .cloned()
            .expect("every task on which the evaluated value depends has run")
    }

    fn run_task(&mut self, id: FutureId) {
        let args: Vec<Value> = self
            .arena
            .task_args(id)
            .expect("waiting queue only ever holds task ids")
            .iter()
            .map(|arg| {
                self.arena
                    .result(*arg)
                    .cloned()
                    .expect("a ready task's args are all done")
            })
            .collect();
        let rule_fn = Rc::clone(
            self.rules
                .get(&id)
                .expect("every task was registered with its rule's closure"),
        );
        tracing::debug!(hashid = %self.arena.hashid(id), "task running");
        let output = rule_fn(&args);
        let outcome = self.arena.wrap_output(output);
        self.arena.complete_task(id, outcome);
        self.drain_ready();
    }

    fn drain_ready(&mut self) {
        for id in self.arena.take_ready_tasks() {
            if self.pending.remove(&id) {
                self.waiting.push_back(id);
            }
        }
    }
}

/// RAII guard around the single active session, acquired from a
/// process-wide mutex. Released on drop — including on panic unwind — so
/// the "one active session" invariant can never leak past its scope.
pub struct SessionGuard {
    session: Session,
}

impl SessionGuard {
    pub fn activate() -> Result<Self, SessionError> {
        let mut active = ACTIVE.lock().expect("session activation lock poisoned");
        if *active {
            return Err(SessionError::AlreadyActive);
        }
        *active = true;
        Ok(Self { session: Session::new() })
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = Session;
    fn deref(&self) -> &Session {
        &self.session
    }
}

impl std::ops::DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *ACTIVE.lock().expect("session activation lock poisoned") = false;
    }
}
