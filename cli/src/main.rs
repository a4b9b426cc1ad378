//! Tether CLI - runs one language server session for an editor.
//!
//! The editor talks to this process over stdin/stdout, one JSON value per
//! line (see [`driver`]). Logs go to a file so stdout stays clean.
//!
//! ```text
//! editor --stdin--> driver --> Session --> language server
//!        <-stdout-- driver <-- events  <--
//! ```

mod config;
mod driver;

use std::{
    env,
    fs::{self, OpenOptions},
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};

use anyhow::{Context, Result, bail};
use tether_lsp::Session;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::driver::Outcome;

const EVENT_CHANNEL_CAPACITY: usize = 256;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env("TETHER_LOG")
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout belongs to the editor protocol; no log file means no logs.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(data_dir) = dirs::data_local_dir() {
        candidates.push(data_dir.join("tether").join("logs").join("tether.log"));
    }
    candidates.push(PathBuf::from(".tether").join("logs").join("tether.log"));
    candidates
}

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Option<Self>> {
        let mut parsed = Args::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "-h" | "--help" => return Ok(None),
                other => bail!("unexpected argument: {other}"),
            }
        }
        Ok(Some(parsed))
    }
}

const USAGE: &str = "usage: tether [--config <path>]

Reads editor events as JSON lines on stdin and writes diagnostics,
server messages and command replies as JSON lines on stdout.";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let Some(args) = Args::parse(env::args().skip(1))? else {
        eprintln!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    };

    init_tracing();

    let config = config::load(args.config.as_deref()).inspect_err(|e| {
        tracing::error!(path = %e.path().display(), "Config unusable");
    })?;
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let session = Session::start(config, events_tx)
        .await
        .context("failed to start language server")?;

    let stdin = BufReader::new(tokio::io::stdin());
    let outcome = driver::run(session, events_rx, stdin, tokio::io::stdout()).await?;

    match outcome {
        Outcome::Finished => Ok(ExitCode::SUCCESS),
        Outcome::ServerUnavailable => {
            eprintln!("Language server unavailable");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Option<Args>> {
        Args::parse(list.iter().map(ToString::to_string))
    }

    #[test]
    fn parses_config_flag() {
        let parsed = args(&["--config", "/etc/tether.toml"]).unwrap().unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/etc/tether.toml")));
        assert!(args(&[]).unwrap().unwrap().config.is_none());
    }

    #[test]
    fn help_and_bad_args() {
        assert!(args(&["--help"]).unwrap().is_none());
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }

    #[test]
    fn log_candidates_end_with_local_fallback() {
        let candidates = log_file_candidates();
        assert_eq!(
            candidates.last(),
            Some(&PathBuf::from(".tether").join("logs").join("tether.log"))
        );
    }
}
