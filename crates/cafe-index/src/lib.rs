//! cafe-index: the relational half of the persistent store.
//!
//! Three tables mirror `caflib/Cellar.py`'s schema exactly: `tasks` (task
//! definition JSON + state), `builds` (one row per `store_build` call), and
//! `targets` (which task hash a build's named targets point at). Backed by
//! `sqlx`'s SQLite driver the way `turborepo-db::DatabaseHandle` wraps a
//! `SqlitePool` and runs embedded migrations on open.

use std::collections::{HashMap, HashSet};

use cafe_hash::Hash;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("failed to migrate index database: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid hash in index: {0}")]
    Hash(#[from] cafe_hash::HashError),
    #[error("unknown task state {0}")]
    UnknownState(i64),
    #[error("task {0} has no stored definition")]
    MissingTask(Hash),
    #[error("malformed build timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// Mirrors `caflib/Cellar.py::State`. Values are the original enum's
/// integers so existing `index.db` files stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Error = -1,
    Clean = 0,
    Done = 1,
    Running = 2,
    Interrupted = 3,
    DoneRemote = 5,
}

impl TaskState {
    fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for TaskState {
    type Error = IndexError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(TaskState::Error),
            0 => Ok(TaskState::Clean),
            1 => Ok(TaskState::Done),
            2 => Ok(TaskState::Running),
            3 => Ok(TaskState::Interrupted),
            5 => Ok(TaskState::DoneRemote),
            other => Err(IndexError::UnknownState(other)),
        }
    }
}

pub struct TaskIndex {
    pool: SqlitePool,
}

impl TaskIndex {
    #[instrument(skip(path))]
    pub async fn open(path: &Utf8Path) -> Result<Self, IndexError> {
        let pool = SqlitePoolOptions::new()
            .connect(&format!("sqlite://{path}?mode=rwc"))
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns `State::ERROR` for a hash with no row, matching the
    /// original's "unknown task is an error" convention.
    pub async fn state(&self, hash: &Hash) -> Result<TaskState, IndexError> {
        let row = sqlx::query("select state from tasks where hash = ?")
            .bind(hash.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => TaskState::try_from(row.get::<i64, _>("state")),
            None => Ok(TaskState::Error),
        }
    }

    pub async fn get_task(&self, hash: &Hash) -> Result<Option<Value>, IndexError> {
        let row = sqlx::query("select task from tasks where hash = ?")
            .bind(hash.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("task"))?)),
            None => Ok(None),
        }
    }

    /// Bulk task lookup. Above ten hashes a temporary table is used instead
    /// of an `in (?, ?, ...)` list, following the original's threshold.
    #[instrument(skip(self, hashes))]
    pub async fn get_tasks(&self, hashes: &[Hash]) -> Result<HashMap<Hash, Value>, IndexError> {
        let mut out = HashMap::new();
        if hashes.is_empty() {
            return Ok(out);
        }
        if hashes.len() < 10 {
            let placeholders = std::iter::repeat("?").take(hashes.len()).collect::<Vec<_>>().join(",");
            let sql = format!("select hash, task from tasks where hash in ({placeholders})");
            let mut query = sqlx::query(&sql);
            for h in hashes {
                query = query.bind(h.to_string());
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in rows {
                let hash: Hash = row.get::<String, _>("hash").parse()?;
                let task = serde_json::from_str(&row.get::<String, _>("task"))?;
                out.insert(hash, task);
            }
        } else {
            let mut tx = self.pool.begin().await?;
            sqlx::query("drop table if exists current_tasks").execute(&mut *tx).await?;
            sqlx::query("create temporary table current_tasks(hash text)")
                .execute(&mut *tx)
                .await?;
            for h in hashes {
                sqlx::query("insert into current_tasks values (?)")
                    .bind(h.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
            let rows = sqlx::query(
                "select tasks.hash, task from tasks join current_tasks \
                 on tasks.hash = current_tasks.hash",
            )
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let hash: Hash = row.get::<String, _>("hash").parse()?;
                let task = serde_json::from_str(&row.get::<String, _>("task"))?;
                out.insert(hash, task);
            }
            tx.commit().await?;
        }
        Ok(out)
    }

    /// Inserts any not-yet-known tasks as `Clean`, opens a new build, and
    /// records its targets. Returns the current state of every task named
    /// in `tasks`, whether freshly inserted or already present.
    #[instrument(skip(self, tasks, targets))]
    pub async fn store_build(
        &self,
        tasks: &HashMap<Hash, Value>,
        targets: &[(String, Hash)],
        now: DateTime<Utc>,
    ) -> Result<(i64, HashMap<Hash, TaskState>), IndexError> {
        let mut tx = self.pool.begin().await?;
        for (hash, task) in tasks {
            sqlx::query("insert or ignore into tasks values (?,?,?,?)")
                .bind(hash.to_string())
                .bind(serde_json::to_string(task)?)
                .bind(now.to_rfc3339())
                .bind(TaskState::Clean.as_i64())
                .execute(&mut *tx)
                .await?;
        }
        let build_id: i64 = sqlx::query("insert into builds(created) values (?)")
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        for (path, hash) in targets {
            sqlx::query("insert into targets values (?,?,?)")
                .bind(hash.to_string())
                .bind(build_id)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        let mut states = HashMap::new();
        for hash in tasks.keys() {
            let row = sqlx::query("select state from tasks where hash = ?")
                .bind(hash.to_string())
                .fetch_one(&mut *tx)
                .await?;
            states.insert(*hash, TaskState::try_from(row.get::<i64, _>("state"))?);
        }
        tx.commit().await?;
        Ok((build_id, states))
    }

    /// Marks a task `DONE` with the given hashed outputs merged into its
    /// stored definition, matching `Cellar.seal_task`.
    #[instrument(skip(self, outputs))]
    pub async fn seal_task(&self, hash: &Hash, outputs: Value) -> Result<(), IndexError> {
        self.update_outputs(hash, TaskState::Done, outputs).await
    }

    /// Clears a task's outputs and returns it to `CLEAN`, matching
    /// `Cellar.reset_task`.
    pub async fn reset_task(&self, hash: &Hash) -> Result<(), IndexError> {
        self.update_outputs(hash, TaskState::Clean, Value::Object(Default::default()))
            .await
    }

    async fn update_outputs(
        &self,
        hash: &Hash,
        state: TaskState,
        outputs: Value,
    ) -> Result<(), IndexError> {
        let mut obj = self
            .get_task(hash)
            .await?
            .ok_or_else(|| IndexError::MissingTask(*hash))?;
        obj.as_object_mut()
            .expect("task definitions are always JSON objects")
            .insert("outputs".to_string(), outputs);
        sqlx::query("update tasks set task = ?, state = ? where hash = ?")
            .bind(serde_json::to_string(&obj)?)
            .bind(state.as_i64())
            .bind(hash.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_builds(&self) -> Result<Vec<DateTime<Utc>>, IndexError> {
        let rows = sqlx::query("select created from builds order by created desc")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(DateTime::parse_from_rfc3339(&row.get::<String, _>("created"))?
                    .with_timezone(&Utc))
            })
            .collect()
    }

    /// Targets of the nth-from-latest build (`nth = 0` is the most recent).
    pub async fn targets_for_build(&self, nth: i64) -> Result<Vec<(String, Hash)>, IndexError> {
        let rows = sqlx::query(
            "select targets.path, targets.taskhash from targets join \
             (select id from builds order by created desc limit 1 offset ?) b \
             on targets.buildid = b.id",
        )
        .bind(nth)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let hash: Hash = row.get::<String, _>("taskhash").parse()?;
                Ok((row.get::<String, _>("path"), hash))
            })
            .collect()
    }

    /// Deletes targets from every build but the latest, then deletes task
    /// rows whose hash is absent from `retain`. Runs in one transaction so
    /// a crash mid-gc never leaves the index half-pruned.
    #[instrument(skip(self, retain))]
    pub async fn gc(&self, retain: &HashSet<Hash>) -> Result<usize, IndexError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "delete from targets where buildid != \
             (select id from builds order by created desc limit 1)",
        )
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query("select hash from tasks").fetch_all(&mut *tx).await?;
        let mut removed = 0;
        for row in rows {
            let hash: Hash = row.get::<String, _>("hash").parse()?;
            if !retain.contains(&hash) {
                sqlx::query("delete from tasks where hash = ?")
                    .bind(hash.to_string())
                    .execute(&mut *tx)
                    .await?;
                removed += 1;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_index() -> (tempfile::TempDir, TaskIndex) {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("index.db")).unwrap();
        let index = TaskIndex::open(&path).await.unwrap();
        (dir, index)
    }

    fn task_hash(n: u8) -> Hash {
        cafe_hash::hash_bytes(&[n])
    }

    #[tokio::test]
    async fn unknown_task_state_is_error() {
        let (_dir, index) = temp_index().await;
        let state = index.state(&task_hash(1)).await.unwrap();
        assert_eq!(state, TaskState::Error);
    }

    #[tokio::test]
    async fn store_build_inserts_tasks_as_clean() {
        let (_dir, index) = temp_index().await;
        let hash = task_hash(1);
        let mut tasks = HashMap::new();
        tasks.insert(hash, json!({"command": "true", "inputs": {}}));
        let (build_id, states) = index
            .store_build(&tasks, &[("root".to_string(), hash)], Utc::now())
            .await
            .unwrap();
        assert!(build_id >= 1);
        assert_eq!(states[&hash], TaskState::Clean);
    }

    #[tokio::test]
    async fn seal_task_marks_done_and_merges_outputs() {
        let (_dir, index) = temp_index().await;
        let hash = task_hash(1);
        let mut tasks = HashMap::new();
        tasks.insert(hash, json!({"command": "true", "inputs": {}}));
        index
            .store_build(&tasks, &[("root".to_string(), hash)], Utc::now())
            .await
            .unwrap();

        index
            .seal_task(&hash, json!({"out.txt": task_hash(2).to_string()}))
            .await
            .unwrap();

        assert_eq!(index.state(&hash).await.unwrap(), TaskState::Done);
        let stored = index.get_task(&hash).await.unwrap().unwrap();
        assert!(stored["outputs"]["out.txt"].is_string());
    }

    #[tokio::test]
    async fn reset_task_returns_to_clean() {
        let (_dir, index) = temp_index().await;
        let hash = task_hash(1);
        let mut tasks = HashMap::new();
        tasks.insert(hash, json!({"command": "true", "inputs": {}}));
        index
            .store_build(&tasks, &[("root".to_string(), hash)], Utc::now())
            .await
            .unwrap();
        index.seal_task(&hash, json!({})).await.unwrap();
        index.reset_task(&hash).await.unwrap();
        assert_eq!(index.state(&hash).await.unwrap(), TaskState::Clean);
    }

    #[tokio::test]
    async fn gc_drops_tasks_not_retained() {
        let (_dir, index) = temp_index().await;
        let keep = task_hash(1);
        let drop = task_hash(2);
        let mut tasks = HashMap::new();
        tasks.insert(keep, json!({"command": "true", "inputs": {}}));
        tasks.insert(drop, json!({"command": "false", "inputs": {}}));
        index
            .store_build(&tasks, &[("a".to_string(), keep), ("b".to_string(), drop)], Utc::now())
            .await
            .unwrap();

        let mut retain = HashSet::new();
        retain.insert(keep);
        let removed = index.gc(&retain).await.unwrap();

        assert_eq!(removed, 1);
        assert!(index.get_task(&keep).await.unwrap().is_some());
        assert!(index.get_task(&drop).await.unwrap().is_none());
    }
}
