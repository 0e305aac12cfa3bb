//! grails-session - owns one analysis-server session for a project.
//!
//! ```text
//! main() -> load config -> Session::spawn -> start -> stdin command loop
//!                                   |
//!                                   v
//!                     event printer (state, progress, messages)
//! ```
//!
//! `quit`, end of input or Ctrl-C dispose the session, which stops the
//! server gracefully before exiting.

mod commands;
mod events;

use anyhow::{Context, Result};
use clap::Parser;
use std::{
    env,
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use grails_config::{SessionFileConfig, load_session_config};
use grails_lsp::{
    DefaultConnector, Session, SessionConfig, SettingsDelivery, StartOutcome,
};

use crate::commands::{Command, HELP};

#[derive(Parser)]
#[command(name = "grails-session")]
#[command(version, about = "Run a Grails analysis server for a project", long_about = None)]
struct Cli {
    /// Config file (defaults to $GRAILS_SESSION_CONFIG, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project root sent to the server (defaults to the current directory)
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Don't start the server until `start` is entered
    #[arg(long)]
    no_start: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_session_log_file();

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

    // stdout carries the console, so fall back to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_session_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
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

    // Primary: <config dir>/grails-session/logs/grails-session.log
    if let Some(config_path) = SessionFileConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("grails-session.log"));
    }

    // Fallback: ./.grails-session/logs/grails-session.log
    candidates.push(
        PathBuf::from(".grails-session")
            .join("logs")
            .join("grails-session.log"),
    );

    candidates
}

/// Load the config and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let (mut config, path) = load_session_config(cli.config.as_deref())?;
    match &path {
        Some(path) => tracing::info!(path = %path.display(), "Loaded config"),
        None => tracing::info!("No config file, using defaults"),
    }

    if let Some(root) = &cli.project_root {
        config.project_root = Some(absolute(root)?);
    } else if config.project_root.is_none() {
        config.project_root =
            Some(env::current_dir().context("failed to read the current directory")?);
    }
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("failed to read the current directory")?;
    Ok(cwd.join(path))
}

fn report_start(outcome: &StartOutcome) {
    match outcome {
        StartOutcome::Running => println!("server is running"),
        StartOutcome::AlreadyRunning => println!("server is already running"),
        StartOutcome::Failed(err) => println!("server failed to start: {err}"),
        StartOutcome::Superseded => println!("start cancelled"),
    }
}

fn report_delivery(delivery: Option<SettingsDelivery>) {
    match delivery {
        Some(SettingsDelivery::Sent) => println!("settings sent"),
        Some(SettingsDelivery::Deferred) => println!("settings will be sent once connected"),
        Some(SettingsDelivery::Withheld) => {
            println!("settings withheld until build tooling is available");
        }
        None => println!("session is gone"),
    }
}

/// Run one command. Returns `false` when the loop should end.
async fn execute(session: &Session, cli: &Cli, command: Command) -> bool {
    match command {
        Command::Start => report_start(&session.start().await),
        Command::Stop => {
            session.stop().await;
            println!("server stopped");
        }
        Command::Restart => report_start(&session.restart().await),
        Command::Status => {
            println!("{}", events::render_status(session.state()));
            for message in session.recent_messages().iter().rev().take(5).rev() {
                println!("  {}", events::render_message(message));
            }
        }
        Command::Reload => match load_config(cli) {
            Ok(config) => {
                let settings = config.settings.clone();
                session.reconfigure(config).await;
                println!("config reloaded; applies on next start");
                if let Some(settings) = settings {
                    report_delivery(session.update_settings(settings).await);
                }
            }
            Err(err) => {
                tracing::warn!("Config reload failed: {err:#}");
                println!("reload failed: {err:#}");
            }
        },
        Command::Settings(settings) => report_delivery(session.update_settings(settings).await),
        Command::Tooling(available) => {
            report_delivery(session.set_tooling_available(available).await);
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    let auto_start = !cli.no_start;
    let session = Session::spawn(config, Arc::new(DefaultConnector::new()));

    let mut subscription = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if let Some(line) = events::render(&event) {
                println!("{line}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    if auto_start {
        tokio::select! {
            outcome = session.start() => report_start(&outcome),
            _ = &mut ctrl_c => {
                session.dispose().await;
                printer.abort();
                return Ok(());
            }
        }
    }

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = &mut ctrl_c => break,
        };
        let Some(line) = line else {
            break;
        };

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };

        let keep_going = tokio::select! {
            keep_going = execute(&session, &cli, command) => keep_going,
            _ = &mut ctrl_c => false,
        };
        if !keep_going {
            break;
        }
    }

    session.dispose().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_sits_beside_the_config_file() {
        let candidates = log_file_candidates();
        if let Some(config_path) = SessionFileConfig::path() {
            let config_dir = config_path.parent().unwrap();
            assert_eq!(
                candidates[0],
                config_dir.join("logs").join("grails-session.log")
            );
        }
        assert_eq!(
            candidates.last().map(PathBuf::as_path),
            Some(Path::new(".grails-session/logs/grails-session.log"))
        );
    }
}
