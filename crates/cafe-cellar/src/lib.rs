//! cafe-cellar: the persistent store as seen by the rest of the engine.
//!
//! Wraps a `cafe_store::FileStore` and a `cafe_index::TaskIndex` behind
//! the method set `caflib/Cellar.py::Cellar` exposes: `store_build`,
//! `seal_task`, `checkout`, `get_tree`, `gc`. Tree walks use an explicit
//! stack rather than recursive calls, following
//! `turborepo-graph-utils::walker`'s non-recursive-traversal idiom, so a
//! deep build tree cannot overflow the stack.

mod task_object;
mod tree;

pub use task_object::TaskObject;
pub use tree::Tree;

use std::collections::{HashMap, HashSet};

use cafe_hash::Hash;
use cafe_index::{IndexError, TaskIndex, TaskState};
use cafe_store::{FileStore, StoreError};
use camino::Utf8Path;
use chrono::Utc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CellarError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("task {0} has no stored definition")]
    MissingTask(Hash),
    #[error("task {0} has not finished and has no outputs to check out")]
    NotFinished(Hash),
    #[error("childlink names child {0:?}, which is not among this task's children")]
    MissingChild(String),
    #[error("childlink source {0:?} is neither an output nor an input of child {1}")]
    MissingChildSource(String, Hash),
}

pub struct Cellar {
    pub store: FileStore,
    pub index: TaskIndex,
}

impl Cellar {
    pub async fn open(cafdir: &Utf8Path) -> Result<Self, CellarError> {
        let store = FileStore::open(cafdir.join("objects"))?;
        let index = TaskIndex::open(&cafdir.join("index.db")).await?;
        Ok(Self { store, index })
    }

    pub async fn state(&self, hash: &Hash) -> Result<TaskState, CellarError> {
        Ok(self.index.state(hash).await?)
    }

    /// Inserts any new tasks, stores any raw input blobs, opens a new
    /// build, and records its targets. Returns every affected task's
    /// current state so callers can decide what, if anything, needs
    /// re-running. Mirrors `Cellar.store_build`.
    #[tracing::instrument(skip(self, tasks, targets, inputs))]
    pub async fn store_build(
        &self,
        tasks: &HashMap<Hash, TaskObject>,
        targets: &[(String, Hash)],
        inputs: &HashMap<Hash, Vec<u8>>,
    ) -> Result<(i64, HashMap<Hash, TaskState>), CellarError> {
        for (hash, bytes) in inputs {
            self.store.store_bytes(*hash, bytes)?;
        }
        let task_values: HashMap<Hash, serde_json::Value> = tasks
            .iter()
            .map(|(h, t)| Ok((*h, serde_json::to_value(t)?)))
            .collect::<Result<_, serde_json::Error>>()
            .map_err(IndexError::from)?;
        let (build_id, states) = self.index.store_build(&task_values, targets, Utc::now()).await?;
        Ok((build_id, states))
    }

    pub async fn get_task(&self, hash: &Hash) -> Result<Option<TaskObject>, CellarError> {
        match self.index.get_task(hash).await? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(IndexError::from)?)),
            None => Ok(None),
        }
    }

    async fn require_task(&self, hash: &Hash) -> Result<TaskObject, CellarError> {
        self.get_task(hash).await?.ok_or(CellarError::MissingTask(*hash))
    }

    /// Hashes and stores each named output file, then atomically records
    /// the task as `DONE` with those hashed outputs. Mirrors
    /// `Cellar.seal_task`.
    #[tracing::instrument(skip(self, outputs))]
    pub async fn seal_task(
        &self,
        hash: &Hash,
        outputs: &HashMap<String, &Utf8Path>,
    ) -> Result<(), CellarError> {
        let mut hashed = std::collections::BTreeMap::new();
        for (name, path) in outputs {
            let bytes = std::fs::read(path).map_err(StoreError::from)?;
            let filehash = cafe_hash::hash_bytes(&bytes);
            self.store.store_bytes(filehash, &bytes)?;
            hashed.insert(name.clone(), filehash);
        }
        let value = serde_json::to_value(&hashed).map_err(IndexError::from)?;
        self.index.seal_task(hash, value).await?;
        Ok(())
    }

    /// Returns a task to `CLEAN` with empty outputs. A hard reset also
    /// frees the task's previous output blobs once they become
    /// unreachable (left to the caller's subsequent `gc`), matching
    /// `Cellar.reset_task` plus the hard-reset extension noted in
    /// DESIGN.md.
    pub async fn reset_task(&self, hash: &Hash) -> Result<(), CellarError> {
        Ok(self.index.reset_task(hash).await?)
    }

    pub async fn list_builds(&self) -> Result<Vec<chrono::DateTime<Utc>>, CellarError> {
        Ok(self.index.list_builds().await?)
    }

    /// The nth-most-recent build's tasks and targets (`nth = 0` latest).
    pub async fn get_build(&self, nth: i64) -> Result<(HashMap<Hash, TaskObject>, Vec<(String, Hash)>), CellarError> {
        let targets = self.index.targets_for_build(nth).await?;
        let mut tasks = HashMap::new();
        for (_, hash) in &targets {
            if !tasks.contains_key(hash) {
                tasks.insert(*hash, self.require_task(hash).await?);
            }
        }
        Ok((tasks, targets))
    }

    /// Flattens the nth build into a `path -> hash` tree by walking every
    /// target's children, using an explicit work stack instead of
    /// recursion. Mirrors `Cellar.get_tree`.
    pub async fn get_tree(&self, nth: i64) -> Result<Tree, CellarError> {
        let (mut tasks, targets) = self.get_build(nth).await?;
        let mut entries: Vec<(String, Hash)> = targets.iter().map(|(p, h)| (p.clone(), *h)).collect();
        let mut stack: Vec<(Hash, String)> = targets.into_iter().map(|(p, h)| (h, p)).collect();

        while let Some((hash, path)) = stack.pop() {
            let task = match tasks.get(&hash) {
                Some(t) => t.clone(),
                None => {
                    let t = self.require_task(&hash).await?;
                    tasks.insert(hash, t.clone());
                    t
                }
            };
            for (name, child_hash) in &task.children {
                let child_path = format!("{path}/{name}");
                entries.push((child_path.clone(), *child_hash));
                stack.push((*child_hash, child_path));
            }
        }
        entries.sort();
        Ok(Tree::new(entries, tasks))
    }

    /// Materializes the nth build under `root`: a directory per matched
    /// virtual path, populated with symlinks (default) or copies
    /// (`nolink`) of each task's input and output blobs. A task hash
    /// already materialized under an earlier path is linked rather than
    /// re-expanded, matching `Cellar.checkout`'s `paths` memoization.
    #[tracing::instrument(skip(self, patterns))]
    pub async fn checkout(
        &self,
        root: &Utf8Path,
        patterns: &[String],
        nth: i64,
        finished_only: bool,
        nolink: bool,
    ) -> Result<usize, CellarError> {
        let (mut tasks, targets) = self.get_build(nth).await?;
        let mut stack: Vec<(Hash, String)> = targets.into_iter().map(|(p, h)| (h, p)).collect();
        let mut materialized: HashMap<Hash, camino::Utf8PathBuf> = HashMap::new();
        let globs: Vec<wax::Glob> = patterns.iter().filter_map(|p| wax::Glob::new(p).ok()).collect();
        let mut checked_out = 0usize;

        while let Some((hash, path)) = stack.pop() {
            let task = match tasks.get(&hash) {
                Some(t) => t.clone(),
                None => {
                    let t = self.require_task(&hash).await?;
                    tasks.insert(hash, t.clone());
                    t
                }
            };
            for (name, child_hash) in &task.children {
                stack.push((*child_hash, format!("{path}/{name}")));
            }
            if !globs.iter().any(|g| g.is_match(path.as_str())) {
                continue;
            }
            if finished_only && task.outputs.is_none() {
                continue;
            }
            let dest = root.join(&path);
            if let Some(existing) = materialized.get(&hash) {
                if !dest.exists() {
                    std::fs::create_dir_all(dest.parent().unwrap_or(root))
                        .map_err(StoreError::from)?;
                    symlink_dir(existing, &dest).map_err(StoreError::from)?;
                }
                continue;
            }
            std::fs::create_dir_all(&dest).map_err(StoreError::from)?;
            self.checkout_task(&task, &dest, nolink, &mut tasks).await?;
            materialized.insert(hash, dest);
            checked_out += 1;
        }
        Ok(checked_out)
    }

    async fn checkout_task(
        &self,
        task: &TaskObject,
        dest: &Utf8Path,
        nolink: bool,
        tasks: &mut HashMap<Hash, TaskObject>,
    ) -> Result<(), CellarError> {
        for (target, filehash) in task.inputs.iter().chain(task.outputs.iter().flatten()) {
            let source = self.store.get(filehash)?;
            self.place(&source, &dest.join(target), nolink)?;
        }
        for (target, (child_name, source_name)) in &task.childlinks {
            let child_hash =
                task.children.get(child_name).ok_or_else(|| CellarError::MissingChild(child_name.clone()))?;
            let child = match tasks.get(child_hash) {
                Some(t) => t.clone(),
                None => {
                    let t = self.require_task(child_hash).await?;
                    tasks.insert(*child_hash, t.clone());
                    t
                }
            };
            let filehash = child
                .outputs
                .as_ref()
                .and_then(|outputs| outputs.get(source_name))
                .or_else(|| child.inputs.get(source_name))
                .ok_or_else(|| CellarError::MissingChildSource(source_name.clone(), *child_hash))?;
            let source = self.store.get(filehash)?;
            self.place(&source, &dest.join(target), nolink)?;
        }
        Ok(())
    }

    fn place(&self, source: &Utf8Path, link: &Utf8Path, nolink: bool) -> Result<(), CellarError> {
        if nolink {
            std::fs::copy(source, link).map_err(StoreError::from)?;
        } else {
            symlink_file(source, link).map_err(StoreError::from)?;
        }
        Ok(())
    }

    /// Prunes every blob not reachable from the current build's tree
    /// (targets, every task's inputs and outputs) and every task row
    /// outside that set. Runs the file-store and index passes back to
    /// back, matching `Cellar.gc`.
    #[tracing::instrument(skip(self))]
    pub async fn gc(&self) -> Result<(usize, usize), CellarError> {
        let tree = self.get_tree(0).await?;
        let mut retain: HashSet<Hash> = tree.iter().map(|(_, h)| *h).collect();
        for task in tree.objects.values() {
            retain.extend(task.inputs.values().copied());
            if let Some(outputs) = &task.outputs {
                retain.extend(outputs.values().copied());
            }
        }
        let files_removed = self.store.gc(&retain)?;
        let tasks_removed = self.index.gc(&retain).await?;
        Ok((files_removed, tasks_removed))
    }
}

#[cfg(unix)]
fn symlink_file(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink_file(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    std::fs::copy(src, dst).map(|_| ())
}

#[cfg(unix)]
fn symlink_dir(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink_dir(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn temp_cellar() -> (tempfile::TempDir, Cellar) {
        let dir = tempfile::tempdir().unwrap();
        let cafdir = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cellar = Cellar::open(&cafdir).await.unwrap();
        (dir, cellar)
    }

    fn leaf_task(command: &str) -> TaskObject {
        TaskObject {
            command: command.to_string(),
            inputs: BTreeMap::new(),
            symlinks: BTreeMap::new(),
            children: BTreeMap::new(),
            childlinks: BTreeMap::new(),
            outputs: None,
        }
    }

    #[tokio::test]
    async fn store_build_and_get_tree_round_trip() {
        let (_dir, cellar) = temp_cellar().await;
        let task = leaf_task("true");
        let hash = cafe_hash::hash_json(&serde_json::to_value(&task).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(hash, task);

        cellar
            .store_build(&tasks, &[("root".to_string(), hash)], &HashMap::new())
            .await
            .unwrap();

        let tree = cellar.get_tree(0).await.unwrap();
        let entries: Vec<_> = tree.iter().collect();
        assert_eq!(entries, vec![&("root".to_string(), hash)]);
    }

    #[tokio::test]
    async fn seal_task_persists_hashed_outputs() {
        let (dir, cellar) = temp_cellar().await;
        let task = leaf_task("echo hi > out.txt");
        let hash = cafe_hash::hash_json(&serde_json::to_value(&task).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(hash, task);
        cellar
            .store_build(&tasks, &[("root".to_string(), hash)], &HashMap::new())
            .await
            .unwrap();

        let out_path = dir.path().join("out.txt");
        std::fs::write(&out_path, b"hi\n").unwrap();
        let utf8_out = camino::Utf8PathBuf::from_path_buf(out_path).unwrap();
        let mut outputs = HashMap::new();
        outputs.insert("out.txt".to_string(), utf8_out.as_path());
        cellar.seal_task(&hash, &outputs).await.unwrap();

        let sealed = cellar.get_task(&hash).await.unwrap().unwrap();
        assert!(sealed.outputs.is_some());
        assert_eq!(cellar.state(&hash).await.unwrap(), TaskState::Done);
    }

    #[tokio::test]
    async fn checkout_resolves_childlinks_against_child_outputs() {
        let (dir, cellar) = temp_cellar().await;

        let child = leaf_task("true");
        let child_hash = cafe_hash::hash_json(&serde_json::to_value(&child).unwrap());

        let mut parent = leaf_task("true");
        parent.children.insert("child".to_string(), child_hash);
        parent.childlinks.insert("composed.txt".to_string(), ("child".to_string(), "out.txt".to_string()));
        let parent_hash = cafe_hash::hash_json(&serde_json::to_value(&parent).unwrap());

        let mut tasks = HashMap::new();
        tasks.insert(child_hash, child);
        tasks.insert(parent_hash, parent);
        cellar
            .store_build(&tasks, &[("root".to_string(), parent_hash)], &HashMap::new())
            .await
            .unwrap();

        let out_path = dir.path().join("out.txt");
        std::fs::write(&out_path, b"composed\n").unwrap();
        let utf8_out = camino::Utf8PathBuf::from_path_buf(out_path).unwrap();
        let mut outputs = HashMap::new();
        outputs.insert("out.txt".to_string(), utf8_out.as_path());
        cellar.seal_task(&child_hash, &outputs).await.unwrap();

        let root = camino::Utf8PathBuf::from_path_buf(dir.path().join("checkout")).unwrap();
        cellar.checkout(&root, &["**".to_string()], 0, false, true).await.unwrap();

        let composed = std::fs::read_to_string(root.join("root").join("composed.txt")).unwrap();
        assert_eq!(composed, "composed\n");
    }

    #[tokio::test]
    async fn gc_prunes_unreferenced_blobs_and_tasks() {
        let (_dir, cellar) = temp_cellar().await;
        let kept = leaf_task("true");
        let kept_hash = cafe_hash::hash_json(&serde_json::to_value(&kept).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(kept_hash, kept);
        cellar
            .store_build(&tasks, &[("root".to_string(), kept_hash)], &HashMap::new())
            .await
            .unwrap();

        let (files_removed, tasks_removed) = cellar.gc().await.unwrap();
        assert_eq!(files_removed, 0);
        assert_eq!(tasks_removed, 0);
        assert!(cellar.get_task(&kept_hash).await.unwrap().is_some());
    }
}
