use std::collections::HashMap;

use cafe_hash::{canonical_json, hash_str};
use serde_json::Value;

use crate::{Arena, FutureId};

/// A JSON-shaped value that may embed live `Future`s in place of a leaf.
/// Stands in for the dynamic object graphs `Template.parse` walks in the
/// original: Rust has no room for a `Future` instance inside a
/// `serde_json::Value`, so the embedding point is made an explicit variant
/// instead of discovered by downcasting at serialization time.
#[derive(Debug, Clone)]
pub enum TemplateValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<TemplateValue>),
    Object(Vec<(String, TemplateValue)>),
    Future(FutureId),
}

impl From<Value> for TemplateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => TemplateValue::Null,
            Value::Bool(b) => TemplateValue::Bool(b),
            Value::Number(n) => TemplateValue::Number(n),
            Value::String(s) => TemplateValue::String(s),
            Value::Array(items) => TemplateValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                TemplateValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl TemplateValue {
    /// Walks the value, replacing every embedded `Future` with a
    /// `{"hashid": "..."}` marker, and returns the canonical JSON string of
    /// the result plus the set of futures referenced, keyed by their own
    /// `hashid`. Mirrors `Template.parse`.
    pub fn parse(&self, arena: &Arena) -> (String, HashMap<String, FutureId>) {
        let mut futures = HashMap::new();
        let marked = self.mark(arena, &mut futures);
        (canonical_json(&marked), futures)
    }

    fn mark(&self, arena: &Arena, futures: &mut HashMap<String, FutureId>) -> Value {
        match self {
            TemplateValue::Null => Value::Null,
            TemplateValue::Bool(b) => Value::Bool(*b),
            TemplateValue::Number(n) => Value::Number(n.clone()),
            TemplateValue::String(s) => Value::String(s.clone()),
            TemplateValue::Array(items) => {
                Value::Array(items.iter().map(|v| v.mark(arena, futures)).collect())
            }
            TemplateValue::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.mark(arena, futures)))
                    .collect(),
            ),
            TemplateValue::Future(id) => {
                let hashid = arena.hashid(*id).to_string();
                futures.insert(hashid.clone(), *id);
                let mut marker = serde_json::Map::new();
                marker.insert("hashid".to_string(), Value::String(hashid));
                Value::Object(marker)
            }
        }
    }

    /// Converts a value known to contain no embedded futures into plain
    /// JSON. Panics if called on a value with a `Future` leaf; callers only
    /// take this branch after `parse` reports an empty future set.
    pub fn into_plain_value(self) -> Value {
        match self {
            TemplateValue::Null => Value::Null,
            TemplateValue::Bool(b) => Value::Bool(b),
            TemplateValue::Number(n) => Value::Number(n),
            TemplateValue::String(s) => Value::String(s),
            TemplateValue::Array(items) => {
                Value::Array(items.into_iter().map(TemplateValue::into_plain_value).collect())
            }
            TemplateValue::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_plain_value()))
                    .collect(),
            ),
            TemplateValue::Future(_) => {
                panic!("into_plain_value called on a template value with an unresolved future")
            }
        }
    }
}

/// Substitutes every `{"hashid": "..."}` marker in `marked` for the
/// resolved result of the future it names. Mirrors `Template.substitute`.
pub fn substitute(marked: &Value, futures: &HashMap<String, FutureId>, arena: &Arena) -> Value {
    match marked {
        Value::Object(map) if map.len() == 1 => {
            if let Some(Value::String(hashid)) = map.get("hashid") {
                if let Some(&id) = futures.get(hashid) {
                    return arena
                        .result(id)
                        .cloned()
                        .expect("substituted future must be done");
                }
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), substitute(v, futures, arena)))
                    .collect(),
            )
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, futures, arena)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, futures, arena)).collect()),
        other => other.clone(),
    }
}

/// A single key in an `Indexor` chain: either a map key or an array index.
#[derive(Debug, Clone)]
pub enum IndexKey {
    Str(String),
    Int(usize),
}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKey::Str(s) => write!(f, "{s}"),
            IndexKey::Int(i) => write!(f, "{i}"),
        }
    }
}

pub fn resolve(value: &Value, keys: &[IndexKey]) -> Option<Value> {
    let mut cur = value.clone();
    for key in keys {
        cur = match key {
            IndexKey::Str(s) => cur.get(s)?.clone(),
            IndexKey::Int(i) => cur.get(i)?.clone(),
        };
    }
    Some(cur)
}

pub(crate) fn hash_jsonstr(jsonstr: &str) -> cafe_hash::Hash {
    hash_str(jsonstr)
}
