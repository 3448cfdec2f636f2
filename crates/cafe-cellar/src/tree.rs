use std::collections::HashMap;

use cafe_hash::Hash;
use wax::Glob;

use crate::TaskObject;

/// A flattened `path -> hash` view of one build's targets and their
/// transitive children, with glob matching over the virtual paths.
/// Mirrors `caflib/Cellar.py::Tree`.
pub struct Tree {
    entries: Vec<(String, Hash)>,
    pub objects: HashMap<Hash, TaskObject>,
}

impl Tree {
    pub fn new(entries: Vec<(String, Hash)>, objects: HashMap<Hash, TaskObject>) -> Self {
        Self { entries, objects }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Hash)> {
        self.entries.iter()
    }

    /// Every `(hash, path)` matching any of `patterns`.
    pub fn glob(&self, patterns: &[String]) -> Vec<(Hash, String)> {
        let globs: Vec<Glob> = patterns.iter().filter_map(|p| Glob::new(p).ok()).collect();
        self.entries
            .iter()
            .filter(|(path, _)| globs.iter().any(|g| g.is_match(path.as_str())))
            .map(|(path, hash)| (*hash, path.clone()))
            .collect()
    }

    /// Matches grouped by the pattern that matched them. A pattern that
    /// matched nothing still appears with an empty group, mirroring
    /// `Cellar.dglob`'s behavior of reporting dead patterns to the caller.
    pub fn dglob(&self, patterns: &[String]) -> HashMap<String, Vec<(Hash, String)>> {
        let mut groups: HashMap<String, Vec<(Hash, String)>> = HashMap::new();
        for pattern in patterns {
            let Ok(glob) = Glob::new(pattern) else {
                groups.entry(pattern.clone()).or_default();
                continue;
            };
            let mut matched_any = false;
            for (path, hash) in &self.entries {
                if glob.is_match(path.as_str()) {
                    groups.entry(pattern.clone()).or_default().push((*hash, path.clone()));
                    matched_any = true;
                }
            }
            if !matched_any {
                groups.entry(pattern.clone()).or_default();
            }
        }
        groups
    }
}
