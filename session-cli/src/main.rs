//! Session CLI - operator tool for the session engine.
//!
//! # Usage
//!
//! ```bash
//! session-cli self-test [portable|native]
//! session-cli --config engine.json identity
//! session-cli --config engine.json one-time-keys 20
//! session-cli --config engine.json cross-signing
//! session-cli --config engine.json export-session <room_id> <session_id>
//! session-cli --config engine.json prune
//! ```
//!
//! Logging honours `RUST_LOG` and defaults to `info`.

mod commands;
mod self_test;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use double_ratchets::BackendKind;
use session_engine::{EngineConfig, SessionEngine};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: session-cli [--config <path>] <command> [args]

commands:
  self-test [portable|native]       run two in-memory engines against each other
  identity                          print this device's public keys
  one-time-keys <count>             generate and print one-time keys
  cross-signing                     generate, sign and print cross-signing keys
  export-session <room> <session>   export an inbound group session
  prune                             drop stale hashes and expired sessions";

struct Args {
    config: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut command = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => bail!("{USAGE}"),
            _ => command.push(arg),
        }
    }
    if command.is_empty() {
        bail!("{USAGE}");
    }
    Ok(Args { config, command })
}

fn open_engine(config: Option<&PathBuf>) -> Result<SessionEngine> {
    let path = config.context("this command needs --config")?;
    let config = EngineConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    tracing::debug!(?config, "loaded config");
    SessionEngine::open(&config).context("failed to open session engine")
}

fn parse_backend(name: &str) -> Result<BackendKind> {
    match name {
        "portable" => Ok(BackendKind::Portable),
        "native" => Ok(BackendKind::Native),
        other => bail!("unknown backend {other:?}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = parse_args()?;
    let command: Vec<&str> = args.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["self-test"] => self_test::run(BackendKind::Portable),
        ["self-test", backend] => self_test::run(parse_backend(backend)?),
        ["identity"] => commands::identity(&open_engine(args.config.as_ref())?),
        ["one-time-keys", count] => {
            let count: usize = count.parse().context("count must be a number")?;
            commands::one_time_keys(&open_engine(args.config.as_ref())?, count)
        }
        ["cross-signing"] => commands::cross_signing(&open_engine(args.config.as_ref())?),
        ["export-session", room_id, session_id] => {
            commands::export_session(&open_engine(args.config.as_ref())?, room_id, session_id)
        }
        ["prune"] => commands::prune(&open_engine(args.config.as_ref())?),
        _ => bail!("{USAGE}"),
    }
}
