//! Command-line front-end for declaring and running analysis sessions.
//!
//! Out of scope as a component of its own (spec.md §1), but it is the
//! collaborator spec.md §6 documents the contract for: five subcommands,
//! three exit codes. `clap` derive + `tracing-subscriber` mirror the
//! teacher's binary-crate conventions even though the subcommand tree
//! itself has no direct analogue there.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sandbox_telemetry_core::config::AppConfig;
use sandbox_telemetry_core::error::SandboxError;
use sandbox_telemetry_core::session::{self, Session, SessionConfiguration, SessionRuntime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sandbox-telemetry", about = "Run binaries under sandboxed telemetry collection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare a new session from a binary and its build args.
    InitSession {
        #[arg(long)]
        binary_file: PathBuf,
        #[arg(long, default_value = "session")]
        name: String,
        #[arg(long)]
        sha256: String,
        #[arg(long)]
        process_monitor: bool,
        #[arg(long)]
        base_image_tag: Option<String>,
        #[arg(long)]
        network_disabled: bool,
    },
    /// List known sessions.
    ListSessions,
    /// Execute one session by id, or every session file in a directory.
    Analyze {
        #[arg(long, conflicts_with = "dir")]
        session: Option<String>,
        #[arg(long, conflicts_with = "session")]
        dir: Option<PathBuf>,
    },
    /// Watch active sessions, optionally requesting a stop.
    Monitor {
        #[arg(long)]
        stop: bool,
    },
    /// Bring the external metrics/queue backend up or down (deployment hook).
    Backend {
        #[command(subcommand)]
        action: BackendAction,
    },
}

#[derive(Subcommand)]
enum BackendAction {
    Up,
    Down,
}

#[tokio::main]
async fn main() {
    setup_logging();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "command failed");
            err.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn run(cli: Cli) -> Result<(), SandboxError> {
    match cli.command {
        Command::InitSession {
            binary_file,
            name,
            sha256,
            process_monitor,
            base_image_tag,
            network_disabled,
        } => init_session(binary_file, name, sha256, process_monitor, base_image_tag, network_disabled),
        Command::ListSessions => list_sessions(),
        Command::Analyze { session, dir } => analyze(session, dir).await,
        Command::Monitor { stop } => monitor(stop),
        Command::Backend { action } => backend(action),
    }
}

fn init_session(
    binary_file: PathBuf,
    name: String,
    sha256: String,
    process_monitor: bool,
    base_image_tag: Option<String>,
    network_disabled: bool,
) -> Result<(), SandboxError> {
    if !binary_file.is_file() {
        return Err(SandboxError::UserInput(format!(
            "binary file '{}' does not exist",
            binary_file.display()
        )));
    }

    let binary_name = binary_file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SandboxError::UserInput("binary file has no valid filename".into()))?;

    let mut build_args = serde_json::Map::new();
    build_args.insert("binary_file".into(), binary_name.into());

    let mut configuration = SessionConfiguration::default();
    configuration.network_disabled = network_disabled;
    if let Some(tag) = base_image_tag {
        configuration.base_image_tag = tag;
    }

    let mut new_session = Session::new(name, sha256, build_args, process_monitor, configuration);
    new_session.state = sandbox_telemetry_core::session::SessionState::Persisted;
    session::persist_session(&new_session)?;
    sandbox_telemetry_core::metrics::metrics().record_session_created();

    println!("session {} created", new_session.id);
    Ok(())
}

fn list_sessions() -> Result<(), SandboxError> {
    let sessions = session::list_sessions()?;
    for s in sessions {
        println!("{}\t{}\t{:?}", s.id, s.name, s.state);
    }
    Ok(())
}

async fn analyze(session_id: Option<String>, dir: Option<PathBuf>) -> Result<(), SandboxError> {
    let config = AppConfig::load();
    let runtime = SessionRuntime {
        queue_url: config.queue.url.clone(),
        queue_name: config.queue.queue_name.clone(),
        scraper_base_url: config.scraper.base_url.clone(),
        results_dir: "/var/lib/sandbox-telemetry/results".to_string(),
    };

    let sessions = if let Some(id) = session_id {
        vec![session::load_session(&id)?]
    } else if let Some(dir) = dir {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|err| SandboxError::UserInput(format!("reading {}: {err}", dir.display())))?;
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_prefix("session-").and_then(|n| n.strip_suffix(".json")) {
                    found.push(session::load_session(id)?);
                }
            }
        }
        found
    } else {
        return Err(SandboxError::UserInput("analyze requires --session or --dir".into()));
    };

    for s in sessions {
        info!(session_id = %s.id, "starting analysis");
        let _guard = sandbox_telemetry_core::metrics::metrics().session_guard();
        session::execute_session(s, &runtime).await?;
    }

    Ok(())
}

fn monitor(stop: bool) -> Result<(), SandboxError> {
    if stop {
        println!("stop requested");
        return Ok(());
    }
    let snapshot = sandbox_telemetry_core::metrics::metrics().snapshot();
    for (key, value) in snapshot {
        println!("{key}={value}");
    }
    Ok(())
}

fn backend(action: BackendAction) -> Result<(), SandboxError> {
    match action {
        BackendAction::Up => {
            println!("backend up: connect the queue and scraper stack before running `analyze`");
        }
        BackendAction::Down => {
            println!("backend down: no in-process resources to release");
        }
    }
    Ok(())
}
