//! `caf`: the command-line front end over the task graph engine. Thin by
//! design — argument parsing, config/log plumbing, and dispatch onto
//! `cafe-cellar`/`cafe-scheduler` — mirroring the teacher's own
//! `turbo`/`turborepo-lib` split between a slim binary and the crates that
//! hold the actual engine.

mod cli;
mod commands;
mod config;
mod context;
mod error;

use clap::Parser;
use cli::{Args, Command};
use context::CommandContext;
use error::CliError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("caf: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<bool, CliError> {
    if matches!(args.command, Command::Init) {
        commands::init(&args.cafdir).await?;
        return Ok(true);
    }

    let argv: Vec<String> = std::env::args().collect();
    let mut ctx = CommandContext::open(&args.cafdir, &argv)?;
    let queue = if args.last { ctx.last_queue().or(args.queue) } else { args.queue };
    commands::dispatch(&mut ctx, args.command, queue).await
}
