use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::classify::needs_testing;
use crate::config::{self, AppConfig};
use crate::notify::ActivityNotifier;
use crate::poll::{Orchestrator, PollOutcome};
use crate::remote::transport::HttpTransport;
use crate::remote::RemoteClient;
use crate::store::StateStore;

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Watch,
    Poll { force: bool, tracker: Option<String> },
    Status,
    Changes { tracker: Option<String>, limit: usize },
    Iterations { workspace: String, project: String },
    Activity { limit: usize },
    Help,
}

/// Parse arguments (without the program name) into a [`Command`].
///
/// Supported forms:
///   sprint-watch [watch]
///   sprint-watch poll [--force] [TRACKER]
///   sprint-watch status
///   sprint-watch changes [TRACKER] [-n N]
///   sprint-watch iterations WORKSPACE PROJECT
///   sprint-watch activity [-n N]
pub fn parse_args(args: &[String]) -> Result<Command> {
    let Some((command, rest)) = args.split_first() else {
        return Ok(Command::Watch);
    };

    match command.as_str() {
        "watch" => {
            expect_no_args("watch", rest)?;
            Ok(Command::Watch)
        }
        "poll" => {
            let mut force = false;
            let mut positional = Vec::new();
            for arg in rest {
                match arg.as_str() {
                    "-f" | "--force" => force = true,
                    flag if flag.starts_with('-') => bail!("Unknown flag for poll: {flag}"),
                    _ => positional.push(arg.clone()),
                }
            }
            if positional.len() > 1 {
                bail!("Usage: sprint-watch poll [--force] [TRACKER]");
            }
            Ok(Command::Poll {
                force,
                tracker: positional.pop(),
            })
        }
        "status" => {
            expect_no_args("status", rest)?;
            Ok(Command::Status)
        }
        "changes" => {
            let (limit, mut positional) = parse_limit(rest)?;
            if positional.len() > 1 {
                bail!("Usage: sprint-watch changes [TRACKER] [-n N]");
            }
            Ok(Command::Changes {
                tracker: positional.pop(),
                limit,
            })
        }
        "iterations" => match rest {
            [workspace, project] => Ok(Command::Iterations {
                workspace: workspace.clone(),
                project: project.clone(),
            }),
            _ => bail!("Usage: sprint-watch iterations <WORKSPACE> <PROJECT>"),
        },
        "activity" => {
            let (limit, positional) = parse_limit(rest)?;
            if !positional.is_empty() {
                bail!("Usage: sprint-watch activity [-n N]");
            }
            Ok(Command::Activity { limit })
        }
        "help" | "-h" | "--help" => Ok(Command::Help),
        other => bail!("Unknown command: {other}\n\nRun `sprint-watch help` for usage."),
    }
}

fn expect_no_args(command: &str, rest: &[String]) -> Result<()> {
    if let Some(extra) = rest.first() {
        bail!("Unexpected argument for {command}: {extra}");
    }
    Ok(())
}

/// Pulls `-n N` out of the arguments, returning the limit and what is left.
fn parse_limit(args: &[String]) -> Result<(usize, Vec<String>)> {
    let mut limit = DEFAULT_LIMIT;
    let mut positional = Vec::new();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-n" | "--limit" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    bail!("Missing value for -n/--limit flag");
                };
                limit = value
                    .parse()
                    .with_context(|| format!("Invalid limit: {value}"))?;
            }
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    Ok((limit, positional))
}

pub async fn run(command: Command) -> Result<()> {
    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let config = config::load_config()?;
    match command {
        Command::Watch => handle_watch(config).await,
        Command::Poll { force, tracker } => handle_poll(&config, force, tracker).await,
        Command::Status => handle_status(&config),
        Command::Changes { tracker, limit } => handle_changes(&config, tracker, limit),
        Command::Iterations { workspace, project } => {
            handle_iterations(&config, &workspace, &project).await
        }
        Command::Activity { limit } => {
            handle_activity(limit);
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let client = RemoteClient::new(
        Arc::new(HttpTransport::new()),
        config.base_url.clone(),
        config.retry.policy(),
    );
    let activity = ActivityLog::open_default();
    let notifier = Arc::new(ActivityNotifier::new(activity.clone()));
    let store = StateStore::open_default()?;

    Ok(Orchestrator::new(
        client,
        notifier,
        store,
        config.trackers.clone(),
        config.active_tracker.clone(),
        config.credential(),
    )
    .with_activity_log(activity))
}

fn require_trackers(config: &AppConfig) -> Result<()> {
    if config.trackers.is_empty() {
        bail!("No trackers configured. Add a [[trackers]] entry to ~/.sprint-watch/config.toml");
    }
    Ok(())
}

async fn handle_watch(config: AppConfig) -> Result<()> {
    require_trackers(&config)?;
    let orchestrator = build_orchestrator(&config)?;
    let mut credential = config.credential();
    let mut tick = tokio::time::interval(Duration::from_secs(config.tick_seconds.max(1)));

    info!(trackers = config.trackers.len(), "watching sprints, Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tick.tick() => {
                reload_config(&orchestrator, &mut credential);
                for (id, outcome) in orchestrator.poll_due(Utc::now()).await {
                    if let PollOutcome::Incomplete(message) = outcome {
                        warn!(tracker = %id, "{message}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Picks up tracker and credential edits made to the config file while
/// watching. A new credential lifts an authentication halt.
fn reload_config(orchestrator: &Orchestrator, credential: &mut Option<String>) {
    let config = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            let error = format!("{e:#}");
            warn!(%error, "keeping previous configuration");
            return;
        }
    };

    let configured: HashSet<&str> = config.trackers.iter().map(|t| t.id.as_str()).collect();
    for tracker in orchestrator.trackers() {
        if !configured.contains(tracker.id.as_str()) {
            info!(tracker = %tracker.id, "tracker removed from configuration");
            orchestrator.remove_tracker(&tracker.id);
        }
    }
    for tracker in &config.trackers {
        orchestrator.upsert_tracker(tracker.clone());
    }

    let latest = config.credential();
    if latest.is_some() && latest != *credential {
        *credential = latest.clone();
        if let Some(key) = latest {
            orchestrator.replace_credential(key);
        }
    }
}

async fn handle_poll(config: &AppConfig, force: bool, tracker: Option<String>) -> Result<()> {
    require_trackers(config)?;
    if let Some(id) = &tracker {
        if config.tracker(id).is_none() {
            bail!("Unknown tracker: {id}");
        }
    }

    let orchestrator = build_orchestrator(config)?;
    let now = Utc::now();
    let outcomes = if force || tracker.is_some() {
        orchestrator.force_refresh(tracker.as_deref(), now).await
    } else {
        orchestrator.poll_due(now).await
    };

    if outcomes.is_empty() {
        println!("Nothing due. Use --force to poll anyway.");
        return Ok(());
    }

    for (id, outcome) in outcomes {
        let name = config
            .tracker(&id)
            .map(|t| t.display_name().to_string())
            .unwrap_or_else(|| id.clone());
        println!("{name}");
        match outcome {
            PollOutcome::Success { .. } => {
                if let Some(status) = orchestrator.status_text(&id) {
                    println!("  {status}");
                }
                for story in orchestrator.live_stories(&id) {
                    let marker = if needs_testing(&story) { "*" } else { " " };
                    println!(
                        "  {marker} {:<10} {:<12} {}{}",
                        story.formatted_id,
                        story.schedule_state.as_deref().unwrap_or("-"),
                        story.title,
                        story
                            .owner
                            .as_deref()
                            .map(|o| format!(" ({o})"))
                            .unwrap_or_default()
                    );
                }
            }
            PollOutcome::Incomplete(message)
            | PollOutcome::AuthFailed(message)
            | PollOutcome::TransientError(message) => println!("  {message}"),
            PollOutcome::Skipped => println!("  skipped"),
        }
    }
    Ok(())
}

fn handle_status(config: &AppConfig) -> Result<()> {
    require_trackers(config)?;
    let store = StateStore::open_default()?;
    let active = config.active_tracker().map(|t| t.id.as_str());

    for tracker in &config.trackers {
        let marker = if Some(tracker.id.as_str()) == active { "*" } else { " " };
        println!(
            "{marker} {} [{}] {}",
            tracker.display_name(),
            tracker.id,
            tracker.iteration_name.as_deref().unwrap_or("")
        );
        let Some(scope) = tracker.scope() else {
            println!("    no sprint selected");
            continue;
        };
        let Some(state) = store.tracker(&tracker.id).filter(|s| s.matches(&scope)) else {
            println!("    never polled");
            continue;
        };

        let fmt = |t: Option<chrono::DateTime<Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".to_string())
        };
        println!("    last checked:      {}", fmt(state.last_checked_at));
        println!("    last notification: {}", fmt(state.last_notification_at));
        println!("    changes recorded:  {}", state.history.len());
        let ready: Vec<&str> = state
            .classified_stories
            .iter()
            .map(|c| c.formatted_id.as_str())
            .collect();
        if ready.is_empty() {
            println!("    ready for testing: none");
        } else {
            println!("    ready for testing: {}", ready.join(", "));
        }
    }
    Ok(())
}

fn handle_changes(config: &AppConfig, tracker: Option<String>, limit: usize) -> Result<()> {
    let tracker = match tracker {
        Some(id) => config
            .tracker(&id)
            .with_context(|| format!("Unknown tracker: {id}"))?,
        None => config
            .active_tracker()
            .context("No trackers configured")?,
    };
    let store = StateStore::open_default()?;
    let Some(state) = store.tracker(&tracker.id) else {
        println!("No changes recorded for {}", tracker.display_name());
        return Ok(());
    };

    for change in state.history.iter().take(limit) {
        let transition = match (&change.schedule_state_from, &change.schedule_state_to) {
            (None, None) => String::new(),
            (from, to) => format!(
                " [{} -> {}]",
                from.as_deref().unwrap_or("?"),
                to.as_deref().unwrap_or("?")
            ),
        };
        println!(
            "{}  {:<10} {}{}{}",
            change.changed_at.format("%Y-%m-%d %H:%M"),
            change.formatted_id,
            change.changed_fields.join(", "),
            transition,
            change
                .actor
                .as_deref()
                .map(|a| format!(" by {a}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn handle_iterations(config: &AppConfig, workspace: &str, project: &str) -> Result<()> {
    let credential = config
        .credential()
        .context("No API key configured. Set SPRINT_WATCH_API_KEY or api_key in config.toml")?;
    let client = RemoteClient::new(
        Arc::new(HttpTransport::new()),
        config.base_url.clone(),
        config.retry.policy(),
    );
    let iterations = client
        .list_iterations(&credential, workspace, project)
        .await
        .context("Failed to list iterations")?;

    let day = |t: Option<chrono::DateTime<Utc>>| {
        t.map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "?".to_string())
    };
    for iteration in iterations {
        println!(
            "{:<14} {:<30} {} .. {}",
            iteration.id,
            iteration.name,
            day(iteration.start),
            day(iteration.end)
        );
    }
    Ok(())
}

fn handle_activity(limit: usize) {
    for event in ActivityLog::open_default().read(None, Some(limit)) {
        let ids = if event.formatted_ids.is_empty() {
            String::new()
        } else {
            format!(" {}", event.formatted_ids.join(", "))
        };
        println!(
            "{}  {:<10} {}{}{}",
            event.timestamp,
            event.tracker,
            event.event,
            ids,
            event
                .message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default()
        );
    }
}

pub fn print_help() {
    println!("sprint-watch: follow Rally sprint stories and flag the ones ready for testing\n");
    println!("USAGE:");
    println!("  sprint-watch                        Poll trackers on their schedule until Ctrl-C");
    println!("  sprint-watch poll [--force] [ID]    Run one pass and print the live stories");
    println!("  sprint-watch status                 Show persisted state per tracker");
    println!("  sprint-watch changes [ID] [-n N]    Show recorded story changes, newest first");
    println!("  sprint-watch iterations WS PROJECT  List a project's sprints");
    println!("  sprint-watch activity [-n N]        Show notifications and poll failures");
    println!();
    println!("CONFIG:");
    println!("  ~/.sprint-watch/config.toml         api_key, base_url, [[trackers]], [retry]");
    println!("  SPRINT_WATCH_API_KEY                Overrides api_key");
    println!("  SPRINT_WATCH_LOG                    Log filter, e.g. sprint_watch=debug");
    println!("  SPRINT_WATCH_LOG_FORMAT             compact (default) or json");
}
