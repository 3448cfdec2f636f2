//! The per-invocation context every command runs with: the resolved
//! `<cafdir>`, its config, and the append-only invocation log. Grounded on
//! `caf/cli.py::CommandContext` — `log` appends one line per invocation,
//! `mod_remote_args` resolves `--last`/`--queue` against `LAST_QUEUE`.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;

use crate::config::Config;
use crate::error::CliError;

pub const DEFAULT_CAFDIR: &str = ".caf";

pub struct CommandContext {
    pub cafdir: Utf8PathBuf,
    pub config: Config,
}

impl CommandContext {
    pub fn open(cafdir: &Utf8Path, argv: &[String]) -> Result<Self, CliError> {
        if !cafdir.join("objects").is_dir() {
            return Err(CliError::CellarMissing(cafdir.to_path_buf()));
        }
        let config = Config::load(&cafdir.join("config.ini"))?;
        let ctx = Self { cafdir: cafdir.to_path_buf(), config };
        ctx.log(argv)?;
        Ok(ctx)
    }

    fn log(&self, argv: &[String]) -> Result<(), CliError> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(self.cafdir.join("log"))?;
        writeln!(file, "{}: {}", Utc::now().to_rfc3339(), argv.join(" "))?;
        Ok(())
    }

    pub fn last_queue(&self) -> Option<String> {
        std::fs::read_to_string(self.cafdir.join("LAST_QUEUE")).ok().map(|s| s.trim().to_string())
    }

    pub fn set_last_queue(&self, url: &str) -> Result<(), CliError> {
        std::fs::write(self.cafdir.join("LAST_QUEUE"), url)?;
        Ok(())
    }

    pub fn sandbox_root(&self) -> Utf8PathBuf {
        self.cafdir.join("sandbox")
    }

    pub fn cellar_handle(&self) -> Utf8PathBuf {
        self.cafdir.clone()
    }
}
