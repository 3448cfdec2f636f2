/// One of the three things the traversal loop can do on a given step.
/// Mirrors `caf2/graph.py::Action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Results,
    Execute,
    Traverse,
}

pub type Priority = [Action; 3];

/// `(RESULTS, EXECUTE, TRAVERSE)` — prefer draining finished work, then
/// starting ready work, then discovering more of the graph. Matches
/// `caf2/graph.py::default_priority`.
pub const DEFAULT_PRIORITY: Priority = [Action::Results, Action::Execute, Action::Traverse];
