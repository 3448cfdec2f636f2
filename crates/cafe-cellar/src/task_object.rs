use std::collections::BTreeMap;

use cafe_hash::Hash;
use serde::{Deserialize, Serialize};

/// A task's persisted definition: the Task JSON v2 schema from `spec.md`
/// §6, mirroring `caflib/Cellar.py::TaskObject`. `outputs` is absent until
/// the task is sealed, and the field is dropped entirely on write rather
/// than serialized as `null` (matching `TaskObject.to_obj`'s `del
/// obj['outputs']`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskObject {
    pub command: String,
    pub inputs: BTreeMap<String, Hash>,
    #[serde(default)]
    pub symlinks: BTreeMap<String, String>,
    #[serde(default)]
    pub children: BTreeMap<String, Hash>,
    #[serde(default)]
    pub childlinks: BTreeMap<String, (String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, Hash>>,
}

impl TaskObject {
    pub fn is_pure_rule(&self) -> bool {
        self.command.is_empty()
    }
}
