//! agentwatch - follow coding-agent transcripts and print activity events
//!
//! Events are written to stdout as JSON lines; logs go to stderr.

use agentwatch::activity::ActivitySettings;
use agentwatch::config::{self, Config};
use agentwatch::registry::AgentRegistry;
use agentwatch::scanner::{latest_session, project_dir_for};
use agentwatch::tailer::AttachFrom;
use agentwatch::worker::replay_transcript;
use agentwatch::{ActivityEvent, AgentId};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "agentwatch", about = "Activity tracker for coding-agent transcripts")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Tail a transcript and print activity events as JSON lines
    Watch {
        /// Project directory holding the transcripts
        #[arg(long, conflicts_with = "cwd")]
        project_dir: Option<PathBuf>,
        /// Workspace the agent runs in (derives the project directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Transcript to follow (defaults to the newest in the project directory)
        #[arg(long)]
        file: Option<PathBuf>,
        /// Read the transcript from the beginning instead of its end
        #[arg(long)]
        from_start: bool,
        /// Neither restore nor save agent state
        #[arg(long)]
        no_state: bool,
    },
    /// Push a transcript through the state machine and print the events (timers ignored)
    Replay {
        /// Transcript file
        file: PathBuf,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("AGENTWATCH_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Serialize)]
struct StampedEvent<'a> {
    at: String,
    #[serde(flatten)]
    event: &'a ActivityEvent,
}

fn print_event(event: &ActivityEvent) {
    let stamped = StampedEvent {
        at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        event,
    };
    match serde_json::to_string(&stamped) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to encode event"),
    }
}

fn resolve_project_dir(project_dir: Option<PathBuf>, cwd: Option<PathBuf>) -> Option<PathBuf> {
    if project_dir.is_some() {
        return project_dir;
    }
    let workspace = cwd.or_else(|| std::env::current_dir().ok())?;
    project_dir_for(&workspace)
}

async fn watch(
    config: Config,
    project_dir: Option<PathBuf>,
    file: Option<PathBuf>,
    from_start: bool,
    persist: bool,
) -> ExitCode {
    let state_path = if persist { config::state_path() } else { None };
    let registry = AgentRegistry::new(config, state_path);
    let mut rx = registry.subscribe();

    let restored = if persist {
        registry.restore(config::load_state()).await
    } else {
        Vec::new()
    };

    let file = match file {
        Some(file) => Some(file),
        None => match &project_dir {
            Some(dir) => latest_session(dir).await,
            None => None,
        },
    };

    let already_tracked = file.as_ref().is_some_and(|f| {
        registry
            .persisted()
            .agents
            .iter()
            .any(|a| &a.log_path == f)
    });

    match file {
        Some(file) if !already_tracked => {
            let from = if from_start {
                AttachFrom::Start
            } else {
                AttachFrom::End
            };
            let id = registry.add_agent(file, project_dir.clone(), from).await;
            info!(agent_id = %id, "following transcript");
        }
        _ if !restored.is_empty() => {
            if let Some(last) = restored.iter().max()
                && let Err(e) = registry.set_focused(Some(*last))
            {
                debug!(agent_id = %last, error = %e, "could not focus restored agent");
            }
            if let Some(dir) = &project_dir {
                registry.ensure_project_scan(dir).await;
            }
        }
        _ => {
            error!(project_dir = ?project_dir, "no transcript to follow; pass --file");
            return ExitCode::FAILURE;
        }
    }

    // Catch up on anything restored agents already know.
    registry.replay_all();

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = &mut interrupted => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Err(e) = registry.save_state() {
        warn!(error = %e, "failed to save state");
    }
    registry.shutdown().await;
    ExitCode::SUCCESS
}

fn replay(config: &Config, file: &Path) -> ExitCode {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            error!(path = %file.display(), error = %e, "failed to read transcript");
            return ExitCode::FAILURE;
        }
    };

    let (events, skips) = replay_transcript(AgentId(1), ActivitySettings::from(config), &text);
    for event in &events {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to encode event"),
        }
    }
    info!(
        events = events.len(),
        malformed = skips.malformed,
        unsupported = skips.unsupported,
        "replay finished"
    );
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };

    match cli.command {
        Command::Watch {
            project_dir,
            cwd,
            file,
            from_start,
            no_state,
        } => {
            let project_dir = resolve_project_dir(project_dir, cwd);
            watch(config, project_dir, file, from_start, !no_state).await
        }
        Command::Replay { file } => replay(&config, &file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_watch_defaults() {
        let cli = Cli::try_parse_from(["agentwatch", "watch"]).unwrap();
        assert_eq!(cli.verbose, 0);
        match cli.command {
            Command::Watch {
                project_dir,
                cwd,
                file,
                from_start,
                no_state,
            } => {
                assert!(project_dir.is_none() && cwd.is_none() && file.is_none());
                assert!(!from_start && !no_state);
            }
            _ => panic!("expected Watch command"),
        }
    }

    #[test]
    fn cli_verbose_three() {
        let cli = Cli::try_parse_from(["agentwatch", "-vvv", "replay", "t.jsonl"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn cli_project_dir_conflicts_with_cwd() {
        assert!(
            Cli::try_parse_from([
                "agentwatch",
                "watch",
                "--project-dir",
                "/p",
                "--cwd",
                "/w"
            ])
            .is_err()
        );
    }

    #[test]
    fn cli_replay_with_config() {
        let cli =
            Cli::try_parse_from(["agentwatch", "--config", "/tmp/c.json", "replay", "s.jsonl"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        match cli.command {
            Command::Replay { file } => assert_eq!(file, PathBuf::from("s.jsonl")),
            _ => panic!("expected Replay command"),
        }
    }

    #[test]
    fn project_dir_flag_wins() {
        let dir = resolve_project_dir(Some(PathBuf::from("/p")), Some(PathBuf::from("/w")));
        assert_eq!(dir, Some(PathBuf::from("/p")));
    }

    #[test]
    fn stamped_event_is_flat() {
        let event = ActivityEvent::AgentToolsClear {
            agent_id: AgentId(2),
        };
        let stamped = StampedEvent {
            at: "2026-01-01T00:00:00.000Z".into(),
            event: &event,
        };
        let value = serde_json::to_value(&stamped).unwrap();
        assert_eq!(value["type"], "agent-tools-clear");
        assert_eq!(value["agentId"], 2);
        assert_eq!(value["at"], "2026-01-01T00:00:00.000Z");
    }
}
