use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process;
use std::sync::Arc;

use claude_sentinel::config::{get_config, Config};
use claude_sentinel::credentials::{CredentialStore, FileCredentialStore};
use claude_sentinel::engine::{DataSourceReliabilityEngine, EngineSettings};
use claude_sentinel::events::{EngineEvent, EventBus};
use claude_sentinel::history::HistoryStore;
use claude_sentinel::logging::init_logging;
use claude_sentinel::remote::{RemoteSource, RemoteUsageClient};
use claude_sentinel::scanner::{LocalLogScanner, LocalLogSource};
use claude_sentinel::sources::UsageSource;
use claude_sentinel::token_lifecycle::TokenLifecycleManager;
use claude_sentinel::{CredentialBlob, OauthCredentials, UsageSnapshot};

#[derive(Parser)]
#[command(name = "claude-sentinel")]
#[command(about = "Reliable Claude usage monitoring with primary/fallback data sources")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll continuously and print snapshots and source-state changes
    Watch {
        /// Seconds between poll cycles
        #[arg(long)]
        interval: Option<u64>,
        /// Fully-failed cycles before the circuit opens
        #[arg(long)]
        ceiling: Option<u32>,
        /// Do not use the remote usage endpoint
        #[arg(long)]
        no_remote: bool,
        /// Do not use local session logs
        #[arg(long)]
        no_local: bool,
        /// Emit events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Run a single poll cycle and print the result
    Snapshot {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Inspect or clear the persisted usage history
    History {
        #[command(subcommand)]
        action: HistoryCommands,
    },
    /// Show per-source configuration and state
    Sources {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Store manually-entered OAuth tokens for an account
    Login {
        /// Access token pasted from an external login flow
        #[arg(long)]
        access_token: String,
        /// Matching refresh token
        #[arg(long)]
        refresh_token: String,
        /// Account id (defaults to the configured primary)
        #[arg(long)]
        account: Option<String>,
    },
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// Print the stored series for an account
    Show {
        /// Account id (defaults to the configured primary)
        #[arg(long)]
        account: Option<String>,
        /// Only show points from the last N hours
        #[arg(long)]
        since_hours: Option<i64>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Delete the stored series for an account
    Clear {
        /// Account id (defaults to the configured primary)
        #[arg(long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let config = get_config();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Snapshot { json: false }) {
        Commands::Watch {
            interval,
            ceiling,
            no_remote,
            no_local,
            json,
        } => {
            if no_remote && no_local {
                eprintln!("Error: at least one data source must stay enabled");
                process::exit(1);
            }

            let mut settings = settings_from(config);
            if let Some(secs) = interval {
                settings.poll_interval = std::time::Duration::from_secs(secs);
            }
            if let Some(n) = ceiling {
                settings.failure_ceiling = n;
            }
            if no_remote {
                settings.remote_enabled = false;
            }
            if no_local {
                settings.local_enabled = false;
            }

            let (engine, events) = match build_engine(config, settings) {
                Ok(built) => built,
                Err(e) => return handle_error(e, json),
            };
            run_watch(engine, events, json).await
        }
        Commands::Snapshot { json } => {
            let (engine, _events) = match build_engine(config, settings_from(config)) {
                Ok(built) => built,
                Err(e) => return handle_error(e, json),
            };
            match engine.poll_cycle().await {
                Ok(Some(snapshot)) => {
                    print_snapshot(&snapshot, json);
                    Ok(())
                }
                Ok(None) => {
                    if json {
                        println!("{{\"error\": \"all enabled sources failed\"}}");
                    } else {
                        eprintln!("{}", "All enabled sources failed".red());
                    }
                    process::exit(1);
                }
                Err(e) => handle_error(e, json),
            }
        }
        Commands::History { action } => match action {
            HistoryCommands::Show {
                account,
                since_hours,
                json,
            } => {
                let history = build_history(config);
                let account = account.unwrap_or_else(|| config.accounts.primary.clone());
                let since = since_hours.map(|h| chrono::Utc::now() - chrono::Duration::hours(h));
                let points = history.query(&account, since).await;
                print_history(&account, &points, json);
                Ok(())
            }
            HistoryCommands::Clear { account } => {
                let history = build_history(config);
                let account = account.unwrap_or_else(|| config.accounts.primary.clone());
                match history.clear(&account).await {
                    Ok(()) => {
                        println!("Cleared history for account '{account}'");
                        Ok(())
                    }
                    Err(e) => handle_error(e.into(), false),
                }
            }
        },
        Commands::Sources { json } => {
            let (engine, _events) = match build_engine(config, settings_from(config)) {
                Ok(built) => built,
                Err(e) => return handle_error(e, json),
            };
            let status = engine.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "remote:    {} ({})",
                    status.remote,
                    if status.remote_enabled { "enabled" } else { "disabled" }
                );
                println!(
                    "local-log: {} ({})",
                    status.local,
                    if status.local_enabled { "enabled" } else { "disabled" }
                );
            }
            Ok(())
        }
        Commands::Login {
            access_token,
            refresh_token,
            account,
        } => {
            let account = account.unwrap_or_else(|| config.accounts.primary.clone());
            let store = FileCredentialStore::new(&config.paths.claude_home);
            // Manually-entered tokens have no server-issued expiry; a
            // far-future one is synthesized.
            let creds = OauthCredentials::manual(access_token, refresh_token, chrono::Utc::now());
            let blob = CredentialBlob {
                claude_ai_oauth: creds,
            };
            let serialized = serde_json::to_string(&blob)?;
            match store.write(&account, &serialized) {
                Ok(()) => {
                    println!("Stored credentials for account '{account}'");
                    Ok(())
                }
                Err(e) => handle_error(e.into(), false),
            }
        }
    }
}

fn settings_from(config: &Config) -> EngineSettings {
    EngineSettings {
        poll_interval: std::time::Duration::from_secs(config.polling.interval_secs),
        failure_ceiling: config.polling.failure_ceiling,
        remote_enabled: config.sources.remote_enabled,
        local_enabled: config.sources.local_enabled,
        primary_account: config.accounts.primary.clone(),
        secondary_accounts: config.accounts.secondary.clone(),
    }
}

fn build_history(config: &Config) -> Arc<HistoryStore> {
    Arc::new(HistoryStore::new(
        &config.paths.history_directory,
        &config.history,
    ))
}

fn build_engine(
    config: &Config,
    settings: EngineSettings,
) -> Result<(Arc<DataSourceReliabilityEngine>, EventBus)> {
    let store = Arc::new(FileCredentialStore::new(&config.paths.claude_home));
    let tokens = Arc::new(TokenLifecycleManager::new(
        store,
        reqwest::Client::new(),
        config.remote.token_url.clone(),
        config.remote.client_id.clone(),
        config.remote.required_scopes.clone(),
    ));
    let client = Arc::new(RemoteUsageClient::new(
        config.remote.usage_url.clone(),
        config.remote.beta_header.clone(),
        std::time::Duration::from_secs(config.remote.timeout_secs),
    )?);
    let remote: Arc<dyn UsageSource> = Arc::new(RemoteSource::new(tokens, client));

    let scanner = LocalLogScanner::new(&config.paths.claude_home);
    let local: Arc<dyn UsageSource> = Arc::new(LocalLogSource::new(
        scanner,
        chrono::Duration::hours(config.sources.local_lookback_hours),
    ));

    let history = build_history(config);
    let events = EventBus::default();
    let engine = Arc::new(DataSourceReliabilityEngine::new(
        settings,
        Some(remote),
        Some(local),
        history,
        events.clone(),
    ));
    Ok((engine, events))
}

async fn run_watch(
    engine: Arc<DataSourceReliabilityEngine>,
    events: EventBus,
    json: bool,
) -> Result<()> {
    // Observers subscribe independently; this printer is just one of them.
    let mut receiver = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            print_event(&event, json);
        }
    });

    // SIGHUP performs the manual circuit-breaker reset without restarting.
    #[cfg(unix)]
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                engine.reset();
            }
        });
    }

    // Ctrl-C is the explicit "stop polling" path.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                engine.shutdown();
            }
        });
    }

    let result = engine.run().await;
    printer.abort();
    result
}

fn print_event(event: &EngineEvent, json: bool) {
    match event {
        EngineEvent::SnapshotProduced(snapshot) => print_snapshot(snapshot, json),
        EngineEvent::SourceStateChanged { source, state } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({"event": "sourceStateChanged", "source": source.to_string(), "state": state})
                );
            } else {
                println!("{} {source} is now {state}", "state".yellow());
            }
        }
        EngineEvent::FallbackEngaged { reason } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({"event": "fallbackEngaged", "reason": reason})
                );
            } else {
                println!(
                    "{} remote source failed ({reason}), switching to local logs",
                    "fallback".yellow()
                );
            }
        }
        EngineEvent::CircuitOpened { total_failures } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({"event": "circuitOpened", "totalFailures": total_failures})
                );
            } else {
                println!(
                    "{} {total_failures} fully-failed cycles; polling halted, send SIGHUP to reset",
                    "circuit open".red().bold()
                );
            }
        }
    }
}

fn print_snapshot(snapshot: &UsageSnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("Error: {e}"),
        }
        return;
    }

    let header = format!(
        "[{}] {} ({})",
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S"),
        snapshot.account_id,
        snapshot.source
    );
    println!("{}", header.bold());

    match (&snapshot.primary, &snapshot.tokens) {
        (Some(primary), _) => {
            println!("  five-hour:  {:>5.1}%", primary.utilization);
            if let Some(secondary) = &snapshot.secondary {
                println!("  seven-day:  {:>5.1}%", secondary.utilization);
            }
            if let Some(opus) = &snapshot.opus {
                println!("  opus (7d):  {:>5.1}%", opus.utilization);
            }
        }
        (None, Some(tokens)) => {
            println!(
                "  tokens: {} in / {} out / {} cache-create / {} cache-read",
                tokens.input_tokens,
                tokens.output_tokens,
                tokens.cache_creation_tokens,
                tokens.cache_read_tokens
            );
            println!("  utilization: {}", "n/a (local logs)".dimmed());
        }
        (None, None) => println!("  {}", "no data".dimmed()),
    }
}

fn print_history(account: &str, points: &[claude_sentinel::UsageDataPoint], json: bool) {
    if json {
        match serde_json::to_string_pretty(points) {
            Ok(out) => println!("{out}"),
            Err(e) => eprintln!("Error: {e}"),
        }
        return;
    }

    if points.is_empty() {
        println!("No history for account '{account}'");
        return;
    }

    println!("{}", format!("History for '{account}'").bold());
    for point in points {
        let secondary = point
            .secondary_percentage
            .map(|p| format!("{p:>5.1}%"))
            .unwrap_or_else(|| "    --".to_string());
        println!(
            "  {}  five-hour {:>5.1}%  seven-day {}  ({})",
            point.timestamp.format("%Y-%m-%d %H:%M"),
            point.primary_percentage,
            secondary,
            point.source
        );
    }
}

fn handle_error(e: anyhow::Error, json: bool) -> Result<()> {
    if json {
        println!("{{\"error\": \"{e}\"}}");
    } else {
        eprintln!("Error: {e}");
    }
    process::exit(1);
}
