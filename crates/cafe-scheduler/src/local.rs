use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use cafe_cellar::{Cellar, CellarError, TaskObject};
use cafe_exec::{DryRunExecutor, LocalExecutor, ShutdownStyle, TaskSpec};
use cafe_hash::Hash;
use cafe_index::TaskState;
use camino::{Utf8Path, Utf8PathBuf};

use crate::action::{Action, Priority, DEFAULT_PRIORITY};
use crate::error::SchedulerError;

/// Which runner executes a task's `command`. Cheap to clone since each
/// variant is an `Arc` over the concrete runner, so a fresh handle can be
/// moved into every spawned execution without re-parsing configuration.
#[derive(Clone)]
pub enum Executor {
    Local(Arc<LocalExecutor>),
    DryRun(Arc<DryRunExecutor>),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub visited: usize,
    pub executed: usize,
    pub errors: usize,
}

/// Drives the DAG from a persisted `Cellar`: discovers work by walking
/// task children, runs whatever isn't already `DONE`/`DONEREMOTE`, and
/// reports completions back to the controller loop over a channel rather
/// than a callback, so no state crosses the controller/executor boundary
/// except through that channel.
pub struct LocalScheduler {
    cellar: Arc<Cellar>,
    executor: Executor,
    sandbox_root: Utf8PathBuf,
    priority: Priority,
    depth_first: bool,
    max_consecutive_errors: usize,
    execution_cap: Option<usize>,
}

impl LocalScheduler {
    pub fn new(cellar: Arc<Cellar>, sandbox_root: Utf8PathBuf) -> Self {
        Self {
            cellar,
            executor: Executor::Local(Arc::new(LocalExecutor::new(ShutdownStyle::Graceful(Duration::from_secs(10))))),
            sandbox_root,
            priority: DEFAULT_PRIORITY,
            depth_first: false,
            max_consecutive_errors: 5,
            execution_cap: None,
        }
    }

    pub fn dry_run(cellar: Arc<Cellar>, sandbox_root: Utf8PathBuf) -> Self {
        Self {
            executor: Executor::DryRun(Arc::new(DryRunExecutor)),
            ..Self::new(cellar, sandbox_root)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depth_first(mut self, depth_first: bool) -> Self {
        self.depth_first = depth_first;
        self
    }

    pub fn with_max_consecutive_errors(mut self, n: usize) -> Self {
        self.max_consecutive_errors = n;
        self
    }

    pub fn with_execution_cap(mut self, cap: Option<usize>) -> Self {
        self.execution_cap = cap;
        self
    }

    /// Resolves `patterns` against the current build's virtual tree (via
    /// `cafe_cellar::Tree::glob`, which matches with `wax`) and runs only
    /// the matched task hashes and their children, optionally in a
    /// randomized order so repeated selective runs don't always execute
    /// independent subtrees in the same order.
    pub async fn run_selective(&self, patterns: &[String], randomize: bool) -> Result<RunSummary, SchedulerError> {
        let tree = self.cellar.get_tree(0).await?;
        let mut targets: Vec<Hash> = tree.glob(patterns).into_iter().map(|(hash, _)| hash).collect();
        if randomize {
            use rand::seq::SliceRandom;
            targets.shuffle(&mut rand::thread_rng());
        }
        self.run(targets).await
    }

    /// Traverses from `targets`, executing every reachable task not
    /// already `DONE`/`DONEREMOTE`. Implements the TRAVERSE/EXECUTE/RESULTS
    /// action triad with `self.priority` deciding which is preferred when
    /// more than one is ready, mirroring `caf2/graph.py::traverse_async`.
    #[tracing::instrument(skip(self, targets))]
    pub async fn run(&self, targets: Vec<Hash>) -> Result<RunSummary, SchedulerError> {
        let mut queued: HashSet<Hash> = targets.iter().copied().collect();
        let mut to_visit: VecDeque<Hash> = targets.into_iter().collect();
        let mut to_execute: VecDeque<Hash> = VecDeque::new();
        let mut visited: HashSet<Hash> = HashSet::new();

        let (results_tx, mut results_rx) =
            tokio::sync::mpsc::unbounded_channel::<(Hash, Result<TaskState, SchedulerError>)>();
        let mut executing = 0usize;
        let mut executed = 0usize;
        let mut errors = 0usize;
        let mut consecutive_errors = 0usize;

        enum Picked {
            Results(Hash, Result<TaskState, SchedulerError>),
            Execute(Hash),
            Traverse(Hash),
        }

        loop {
            let execute_allowed = self.execution_cap.map_or(true, |cap| executed + executing < cap);

            let mut picked = None;
            for action in self.priority {
                picked = match action {
                    Action::Results => match results_rx.try_recv() {
                        Ok((hash, outcome)) => Some(Picked::Results(hash, outcome)),
                        Err(_) => None,
                    },
                    Action::Execute if execute_allowed => to_execute.pop_front().map(Picked::Execute),
                    Action::Execute => None,
                    Action::Traverse => {
                        let next = if self.depth_first { to_visit.pop_back() } else { to_visit.pop_front() };
                        next.map(Picked::Traverse)
                    }
                };
                if picked.is_some() {
                    break;
                }
            }

            let picked = match picked {
                Some(picked) => picked,
                None if executing > 0 => {
                    let (hash, outcome) = results_rx
                        .recv()
                        .await
                        .expect("a sender stays alive for every in-flight execution");
                    Picked::Results(hash, outcome)
                }
                None => break,
            };

            match picked {
                Picked::Traverse(hash) => {
                    visited.insert(hash);
                    let state = self.cellar.state(&hash).await?;
                    let task = self.cellar.get_task(&hash).await?.ok_or(SchedulerError::MissingTask(hash))?;
                    for child in task.children.values() {
                        if queued.insert(*child) {
                            to_visit.push_back(*child);
                        }
                    }
                    if !matches!(state, TaskState::Done | TaskState::DoneRemote) {
                        to_execute.push_back(hash);
                    }
                }
                Picked::Execute(hash) => {
                    executing += 1;
                    let cellar = Arc::clone(&self.cellar);
                    let executor = self.executor.clone();
                    let sandbox_root = self.sandbox_root.clone();
                    let tx = results_tx.clone();
                    tokio::spawn(async move {
                        let outcome = execute_one_task(&cellar, &executor, &sandbox_root, hash).await;
                        let _ = tx.send((hash, outcome));
                    });
                }
                Picked::Results(hash, outcome) => {
                    executing -= 1;
                    executed += 1;
                    match outcome {
                        Ok(TaskState::Error) => {
                            errors += 1;
                            consecutive_errors += 1;
                        }
                        Ok(_) => consecutive_errors = 0,
                        Err(err) => {
                            errors += 1;
                            consecutive_errors += 1;
                            tracing::warn!(%hash, error = %err, "task execution failed");
                        }
                    }
                    tracing::debug!(
                        executing,
                        to_execute = to_execute.len(),
                        to_visit = to_visit.len(),
                        executed,
                        errors,
                        "traversal step"
                    );
                    if consecutive_errors > self.max_consecutive_errors {
                        return Err(SchedulerError::TooManyConsecutiveErrors(self.max_consecutive_errors));
                    }
                }
            }
        }

        Ok(RunSummary { visited: visited.len(), executed, errors })
    }
}

pub(crate) async fn execute_one_task(
    cellar: &Cellar,
    executor: &Executor,
    sandbox_root: &Utf8Path,
    hash: Hash,
) -> Result<TaskState, SchedulerError> {
    let task = cellar.get_task(&hash).await?.ok_or(SchedulerError::MissingTask(hash))?;

    if task.is_pure_rule() {
        cellar.seal_task(&hash, &HashMap::new()).await?;
        return Ok(TaskState::Done);
    }

    let sandbox = sandbox_root.join(hash.to_string());
    std::fs::create_dir_all(&sandbox)?;
    materialize_inputs(cellar, &task, &sandbox).await?;

    let spec = TaskSpec { command: &task.command, sandbox: &sandbox };
    let outcome = match executor {
        Executor::Local(local) => local.run(&spec, None).await?,
        Executor::DryRun(dry) => dry.run(&spec),
    };

    if !outcome.success {
        tracing::warn!(%hash, stderr = %String::from_utf8_lossy(&outcome.stderr), "task command failed");
        return Ok(TaskState::Error);
    }

    let outputs = collect_outputs(&sandbox, &task)?;
    let output_paths: HashMap<String, &Utf8Path> = outputs.iter().map(|(name, path)| (name.clone(), path.as_path())).collect();
    cellar.seal_task(&hash, &output_paths).await?;
    Ok(TaskState::Done)
}

/// Symlinks every declared input blob into the sandbox under its task-local
/// name, matching `Cellar.checkout_task`'s link-not-copy default. `childlinks`
/// compose a file from a sibling child task's outputs (falling back to its
/// inputs), matching `caflib/Cellar.py::checkout_task`'s
/// `childtask.outputs.get(source, childtask.inputs.get(source))` resolution.
async fn materialize_inputs(cellar: &Cellar, task: &TaskObject, sandbox: &Utf8Path) -> Result<(), SchedulerError> {
    for (name, filehash) in &task.inputs {
        let source = cellar.store.get(filehash).map_err(CellarError::from)?;
        link_file(&source, &sandbox.join(name))?;
    }
    for (name, (child_name, source_name)) in &task.childlinks {
        let child_hash = task
            .children
            .get(child_name)
            .ok_or_else(|| CellarError::MissingChild(child_name.clone()))?;
        let child = cellar.get_task(child_hash).await?.ok_or(SchedulerError::MissingTask(*child_hash))?;
        let filehash = child
            .outputs
            .as_ref()
            .and_then(|outputs| outputs.get(source_name))
            .or_else(|| child.inputs.get(source_name))
            .ok_or_else(|| CellarError::MissingChildSource(source_name.clone(), *child_hash))?;
        let source = cellar.store.get(filehash).map_err(CellarError::from)?;
        link_file(&source, &sandbox.join(name))?;
    }
    Ok(())
}

/// Everything left in the sandbox after the command ran that isn't one of
/// the inputs (direct or composed via `childlinks`) we put there is an
/// output, keyed by its path relative to the sandbox root.
fn collect_outputs(sandbox: &Utf8Path, task: &TaskObject) -> Result<HashMap<String, Utf8PathBuf>, SchedulerError> {
    let mut outputs = HashMap::new();
    for entry in std::fs::read_dir(sandbox)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if task.inputs.contains_key(&name) || task.childlinks.contains_key(&name) {
            continue;
        }
        if entry.file_type()?.is_file() {
            let path = Utf8PathBuf::from_path_buf(entry.path()).expect("sandbox paths are UTF-8");
            outputs.insert(name, path);
        }
    }
    Ok(outputs)
}

#[cfg(unix)]
fn link_file(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn link_file(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    std::fs::copy(src, dst).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn temp_scheduler() -> (tempfile::TempDir, tempfile::TempDir, LocalScheduler) {
        let cafdir = tempfile::tempdir().unwrap();
        let sandbox_dir = tempfile::tempdir().unwrap();
        let cafdir_path = camino::Utf8PathBuf::from_path_buf(cafdir.path().to_path_buf()).unwrap();
        let sandbox_path = camino::Utf8PathBuf::from_path_buf(sandbox_dir.path().to_path_buf()).unwrap();
        let cellar = Arc::new(Cellar::open(&cafdir_path).await.unwrap());
        let scheduler = LocalScheduler::dry_run(cellar, sandbox_path);
        (cafdir, sandbox_dir, scheduler)
    }

    fn task(command: &str, children: BTreeMap<String, Hash>) -> TaskObject {
        TaskObject {
            command: command.to_string(),
            inputs: BTreeMap::new(),
            symlinks: BTreeMap::new(),
            children,
            childlinks: BTreeMap::new(),
            outputs: None,
        }
    }

    #[tokio::test]
    async fn run_executes_every_unfinished_reachable_task() {
        let (_cafdir, _sandbox, scheduler) = temp_scheduler().await;
        let child = task("true", BTreeMap::new());
        let child_hash = cafe_hash::hash_json(&serde_json::to_value(&child).unwrap());
        let mut children = BTreeMap::new();
        children.insert("child".to_string(), child_hash);
        let root = task("true", children);
        let root_hash = cafe_hash::hash_json(&serde_json::to_value(&root).unwrap());

        let mut tasks = HashMap::new();
        tasks.insert(root_hash, root);
        tasks.insert(child_hash, child);
        scheduler
            .cellar
            .store_build(&tasks, &[("root".to_string(), root_hash)], &HashMap::new())
            .await
            .unwrap();

        let summary = scheduler.run(vec![root_hash]).await.unwrap();

        assert_eq!(summary.visited, 2);
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.errors, 0);
        assert_eq!(scheduler.cellar.state(&root_hash).await.unwrap(), TaskState::Done);
        assert_eq!(scheduler.cellar.state(&child_hash).await.unwrap(), TaskState::Done);
    }

    #[tokio::test]
    async fn run_skips_tasks_already_done() {
        let (_cafdir, _sandbox, scheduler) = temp_scheduler().await;
        let root = task("true", BTreeMap::new());
        let root_hash = cafe_hash::hash_json(&serde_json::to_value(&root).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(root_hash, root);
        scheduler
            .cellar
            .store_build(&tasks, &[("root".to_string(), root_hash)], &HashMap::new())
            .await
            .unwrap();
        scheduler.cellar.seal_task(&root_hash, &HashMap::new()).await.unwrap();

        let summary = scheduler.run(vec![root_hash]).await.unwrap();

        assert_eq!(summary.visited, 1);
        assert_eq!(summary.executed, 0);
    }

    #[tokio::test]
    async fn execute_one_task_materializes_childlinks_into_sandbox() {
        let (dir, _sandbox, scheduler) = temp_scheduler().await;

        let child = task("true", BTreeMap::new());
        let child_hash = cafe_hash::hash_json(&serde_json::to_value(&child).unwrap());
        let mut children = BTreeMap::new();
        children.insert("child".to_string(), child_hash);
        let mut root = task("true", children);
        root.childlinks.insert("composed.txt".to_string(), ("child".to_string(), "out.txt".to_string()));
        let root_hash = cafe_hash::hash_json(&serde_json::to_value(&root).unwrap());

        let mut tasks = HashMap::new();
        tasks.insert(child_hash, child);
        tasks.insert(root_hash, root);
        scheduler
            .cellar
            .store_build(&tasks, &[("root".to_string(), root_hash)], &HashMap::new())
            .await
            .unwrap();

        let out_path = dir.path().join("out.txt");
        std::fs::write(&out_path, b"composed\n").unwrap();
        let utf8_out = camino::Utf8PathBuf::from_path_buf(out_path).unwrap();
        let mut child_outputs = HashMap::new();
        child_outputs.insert("out.txt".to_string(), utf8_out.as_path());
        scheduler.cellar.seal_task(&child_hash, &child_outputs).await.unwrap();

        let state = execute_one_task(&scheduler.cellar, &scheduler.executor, &scheduler.sandbox_root, root_hash)
            .await
            .unwrap();
        assert_eq!(state, TaskState::Done);

        let composed = std::fs::read_to_string(scheduler.sandbox_root.join(root_hash.to_string()).join("composed.txt")).unwrap();
        assert_eq!(composed, "composed\n");

        let sealed = scheduler.cellar.get_task(&root_hash).await.unwrap().unwrap();
        let composed_is_output = sealed.outputs.map(|o| o.contains_key("composed.txt")).unwrap_or(false);
        assert!(!composed_is_output);
    }

    #[tokio::test]
    async fn run_counts_failed_command_as_error_state() {
        let (_cafdir, _sandbox, scheduler) = temp_scheduler().await;
        let executor = Executor::Local(Arc::new(LocalExecutor::new(ShutdownStyle::Kill)));
        let scheduler = LocalScheduler { executor, ..scheduler };
        let root = task("exit 1", BTreeMap::new());
        let root_hash = cafe_hash::hash_json(&serde_json::to_value(&root).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(root_hash, root);
        scheduler
            .cellar
            .store_build(&tasks, &[("root".to_string(), root_hash)], &HashMap::new())
            .await
            .unwrap();

        let summary = scheduler.run(vec![root_hash]).await.unwrap();

        assert_eq!(summary.errors, 1);
        assert_eq!(scheduler.cellar.state(&root_hash).await.unwrap(), TaskState::Error);
    }
}
