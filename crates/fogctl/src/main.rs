//! fogctl - CLI client for the fogd control plane.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateSessionRequest};
use fog_core::RunState;
use std::collections::HashMap;
use std::time::Duration;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Poll interval while following a run's events.
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// CLI client for the fogd daemon.
#[derive(Parser)]
#[command(name = "fogctl")]
#[command(about = "Drive AI coding sessions through the fogd daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7700)
    #[arg(long, global = true, env = "FOG_ADDR")]
    addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session with a first prompt
    Run {
        /// Registered repo (owner/name)
        repo: String,
        /// Natural-language prompt
        prompt: String,
        /// Tool: cursor, claude, gemini, aider
        #[arg(long)]
        tool: Option<String>,
        /// Model override for the tool
        #[arg(long)]
        model: Option<String>,
        /// Explicit branch name (protected branches rejected)
        #[arg(long)]
        branch: Option<String>,
        /// Open a pull request after a successful push
        #[arg(long)]
        autopr: bool,
        /// Stream run events until completion
        #[arg(long)]
        follow: bool,
    },
    /// Submit a follow-up prompt to an existing session
    Prompt {
        session_id: String,
        prompt: String,
        /// Queue behind the current run instead of failing when busy
        #[arg(long)]
        queue: bool,
        /// Stream run events until completion
        #[arg(long)]
        follow: bool,
    },
    /// Session operations
    #[command(subcommand)]
    Session(SessionCommand),
    /// Stream or list events for a run
    Events {
        session_id: String,
        run_id: String,
        /// Only events with seq greater than this
        #[arg(long, default_value_t = 0)]
        since: i64,
        /// Keep polling until the run is terminal
        #[arg(long)]
        follow: bool,
    },
    /// Cancel an in-flight run
    Cancel { session_id: String, run_id: String },
    /// Repo operations
    #[command(subcommand)]
    Repos(ReposCommand),
    /// Settings operations
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Check daemon health
    Health,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// List sessions
    List,
    /// Show a session and its runs
    Show { session_id: String },
    /// Archive a session (no further runs)
    Archive { session_id: String },
}

#[derive(Subcommand)]
enum ReposCommand {
    /// List registered repos
    List,
    /// Register a repo by name and clone URL
    Import { name: String, url: String },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print all settings
    Get,
    /// Set a settings key
    Set { key: String, value: String },
}

fn main() {
    let cli = Cli::parse();
    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7700".to_string());
    let client = Client::new(&addr);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(dispatch(&client, cli.command)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(client: &Client, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Run {
            repo,
            prompt,
            tool,
            model,
            branch,
            autopr,
            follow,
        } => {
            let created = client
                .create_session(&CreateSessionRequest {
                    repo,
                    prompt,
                    tool,
                    model,
                    branch_name: branch,
                    autopr,
                })
                .await?;
            println!("Session: {}", created.session_id);
            println!("Run:     {} ({})", created.run_id, created.status);
            if follow {
                follow_run(client, created.session_id.as_ref(), created.run_id.as_ref()).await?;
            }
        }
        Command::Prompt {
            session_id,
            prompt,
            queue,
            follow,
        } => {
            let created = client.create_run(&session_id, &prompt, queue).await?;
            println!(
                "Run: {} on session {} ({})",
                created.run_id, created.session, created.status
            );
            if follow {
                follow_run(client, &session_id, created.run_id.as_ref()).await?;
            }
        }
        Command::Session(SessionCommand::List) => {
            let sessions = client.list_sessions().await?;
            render::print_session_list(&sessions);
        }
        Command::Session(SessionCommand::Show { session_id }) => {
            let bundle = client.get_session(&session_id).await?;
            render::print_session_details(&bundle.session, &bundle.runs);
        }
        Command::Session(SessionCommand::Archive { session_id }) => {
            client.archive_session(&session_id).await?;
            println!("Archived session {session_id}");
        }
        Command::Events {
            session_id,
            run_id,
            since,
            follow,
        } => {
            if follow {
                follow_run_from(client, &session_id, &run_id, since).await?;
            } else {
                let events = client.list_events(&session_id, &run_id, since).await?;
                render::print_events(&events);
            }
        }
        Command::Cancel { session_id, run_id } => {
            client.cancel_run(&session_id, &run_id).await?;
            println!("Cancel requested for run {run_id}");
        }
        Command::Repos(ReposCommand::List) => {
            let repos = client.list_repos().await?;
            render::print_repo_list(&repos);
        }
        Command::Repos(ReposCommand::Import { name, url }) => {
            let repo = client.import_repo(&name, &url).await?;
            println!("Registered {} ({})", repo.name, repo.default_branch);
        }
        Command::Settings(SettingsCommand::Get) => {
            let settings = client.get_settings().await?;
            let mut keys: Vec<&String> = settings.keys().collect();
            keys.sort();
            for key in keys {
                println!("{key}={}", settings[key]);
            }
        }
        Command::Settings(SettingsCommand::Set { key, value }) => {
            let mut settings = HashMap::new();
            settings.insert(key, value);
            client.put_settings(&settings).await?;
        }
        Command::Health => {
            if client.check_health().await? {
                println!("ok ({})", client.addr());
            } else {
                eprintln!("unhealthy ({})", client.addr());
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn follow_run(client: &Client, session_id: &str, run_id: &str) -> Result<(), ClientError> {
    follow_run_from(client, session_id, run_id, 0).await
}

/// Poll events until the run reaches a terminal state.
async fn follow_run_from(
    client: &Client,
    session_id: &str,
    run_id: &str,
    mut since: i64,
) -> Result<(), ClientError> {
    loop {
        let events = client.list_events(session_id, run_id, since).await?;
        if !events.is_empty() {
            render::print_events(&events);
            since = events.last().map(|e| e.seq).unwrap_or(since);
        }

        let bundle = client.get_session(session_id).await?;
        let terminal = bundle
            .runs
            .iter()
            .find(|r| r.id.as_ref() == run_id)
            .map(|r| r.state)
            .is_some_and(|state| state.is_terminal());
        if terminal {
            if let Some(run) = bundle.runs.iter().find(|r| r.id.as_ref() == run_id) {
                print_final_state(run.state, run.summary.as_deref());
            }
            return Ok(());
        }

        tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
    }
}

fn print_final_state(state: RunState, summary: Option<&str>) {
    match summary {
        Some(summary) => println!("Run finished: {} ({summary})", state.as_str()),
        None => println!("Run finished: {}", state.as_str()),
    }
}
