use std::sync::Arc;

use cafe_cellar::Cellar;
use cafe_hash::Hash;
use cafe_index::TaskState;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::local::{Executor, RunSummary};

#[derive(Deserialize)]
struct QueueItem {
    hash: String,
}

#[derive(Serialize)]
struct Completion {
    hash: String,
    state: i64,
}

/// Pulls task hashes from an HTTP queue and posts completions back,
/// otherwise running the identical execute-and-seal state machine as
/// `LocalScheduler`. Matches the remote half of the scheduler from
/// `spec.md` §6: `GET queue/{id}` until it reports no work, `POST
/// queue/{id}` with `{hash, state}` after each task.
pub struct RemoteScheduler {
    client: reqwest::Client,
    queue_url: String,
    cellar: Arc<Cellar>,
}

impl RemoteScheduler {
    pub fn new(cellar: Arc<Cellar>, queue_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), queue_url: queue_url.into(), cellar }
    }

    #[tracing::instrument(skip(self, executor))]
    pub async fn run(&self, executor: &Executor, sandbox_root: &Utf8Path) -> Result<RunSummary, SchedulerError> {
        let mut summary = RunSummary::default();
        loop {
            let response = self.client.get(&self.queue_url).send().await?;
            if response.status() == reqwest::StatusCode::NO_CONTENT {
                break;
            }
            let item: QueueItem = response.json().await?;
            let hash: Hash = item.hash.parse()?;
            summary.visited += 1;

            let remote_state = self.cellar.state(&hash).await?;
            let state = if matches!(remote_state, TaskState::Done | TaskState::DoneRemote) {
                remote_state
            } else {
                summary.executed += 1;
                match crate::local::execute_one_task(&self.cellar, executor, sandbox_root, hash).await {
                    Ok(state) => state,
                    Err(err) => {
                        tracing::warn!(%hash, error = %err, "remote task execution failed");
                        TaskState::Error
                    }
                }
            };
            if matches!(state, TaskState::Error) {
                summary.errors += 1;
            }

            self.client
                .post(&self.queue_url)
                .json(&Completion { hash: hash.to_string(), state: state_code(state) })
                .send()
                .await?;
        }
        Ok(summary)
    }
}

fn state_code(state: TaskState) -> i64 {
    match state {
        TaskState::Error => -1,
        TaskState::Clean => 0,
        TaskState::Done => 1,
        TaskState::Running => 2,
        TaskState::Interrupted => 3,
        TaskState::DoneRemote => 5,
    }
}
