//! Operator CLI for persisted threads.
//!
//! Reads `threadwork.toml` (or `--config`), lists and inspects thread
//! records, and merges or discards thread branches. It never talks to a
//! model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use threadwork::core::types::{Content, Thread, ThreadId};
use threadwork::domain::MergeOutcome;
use threadwork::error::EngineError;
use threadwork::exit_codes;
use threadwork::io::config::{DomainConfig, EngineConfig, load_config, write_config};
use threadwork::io::model::Offline;
use threadwork::{Engine, logging};

const DEFAULT_CONFIG: &str = "threadwork.toml";

#[derive(Parser)]
#[command(
    name = "threadwork",
    version,
    about = "Inspect and maintain agent threads"
)]
struct Cli {
    /// Path to the engine config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config and create the data directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
        /// Register a domain as NAME=PATH. Repeatable.
        #[arg(long = "domain", value_parser = parse_domain)]
        domains: Vec<DomainConfig>,
    },
    /// Parse and validate the config.
    CheckConfig,
    /// Inspect persisted threads.
    #[command(subcommand)]
    Threads(ThreadsCommand),
    /// Commit and merge a thread branch into its domain's default branch.
    Merge { id: String },
    /// Drop a thread's branch, worktree and sandbox.
    Discard { id: String },
}

#[derive(Subcommand)]
enum ThreadsCommand {
    /// One line per thread, newest first.
    List,
    /// Status and transcript of one thread.
    Show {
        id: String,
        /// Also print the branch diff against the default branch.
        #[arg(long)]
        diff: bool,
        /// Print the raw record as JSON.
        #[arg(long, conflicts_with = "diff")]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            match err.downcast_ref::<EngineError>() {
                Some(EngineError::ThreadClosed { .. }) => exit_codes::CLOSED,
                _ => exit_codes::INVALID,
            }
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, domains } => cmd_init(&cli.config, force, domains),
        Command::CheckConfig => cmd_check_config(&cli.config),
        Command::Threads(ThreadsCommand::List) => cmd_list(&open_engine(&cli.config)?).await,
        Command::Threads(ThreadsCommand::Show { id, diff, json }) => {
            cmd_show(&open_engine(&cli.config)?, &ThreadId::new(id), diff, json).await
        }
        Command::Merge { id } => cmd_merge(&open_engine(&cli.config)?, &ThreadId::new(id)).await,
        Command::Discard { id } => {
            open_engine(&cli.config)?
                .discard(&ThreadId::new(id))
                .await?;
            Ok(exit_codes::OK)
        }
    }
}

fn open_engine(config_path: &Path) -> Result<Engine> {
    let config = load_config(config_path)?;
    Engine::with_docker(config, Arc::new(Offline))
}

fn parse_domain(raw: &str) -> Result<DomainConfig> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=PATH, got '{raw}'"))?;
    if name.trim().is_empty() || path.trim().is_empty() {
        return Err(anyhow!("expected NAME=PATH, got '{raw}'"));
    }
    Ok(DomainConfig::new(name.trim(), path.trim()))
}

fn cmd_init(config_path: &Path, force: bool, domains: Vec<DomainConfig>) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} exists, keeping it", config_path.display());
    } else {
        let config = EngineConfig {
            domains,
            ..EngineConfig::default()
        };
        write_config(config_path, &config)?;
        println!("wrote {}", config_path.display());
    }
    let config = load_config(config_path)?;
    std::fs::create_dir_all(config.threads_dir())
        .with_context(|| format!("create {}", config.threads_dir().display()))?;
    Ok(exit_codes::OK)
}

fn cmd_check_config(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    println!(
        "ok: {} domain(s), {} tool(s), sandbox {}",
        config.domains.len(),
        config.tools.len(),
        if config.sandbox.enabled {
            config.sandbox.runtime.as_str()
        } else {
            "disabled"
        }
    );
    for domain in &config.domains {
        println!(
            "  {} -> {} ({})",
            domain.name,
            domain.path.display(),
            domain.default_branch
        );
    }
    Ok(exit_codes::OK)
}

async fn cmd_list(engine: &Engine) -> Result<i32> {
    for thread in engine.list_threads().await? {
        println!("{}", summary_line(&thread));
    }
    Ok(exit_codes::OK)
}

fn summary_line(thread: &Thread) -> String {
    let mut line = format!(
        "{}  {:<13}  {:<12}  steps={:<3} updated={}",
        thread.id,
        thread.status.as_str(),
        thread.domain,
        thread.steps,
        thread.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(title) = &thread.title {
        line.push_str("  ");
        line.push_str(title);
    }
    line
}

async fn cmd_show(engine: &Engine, id: &ThreadId, diff: bool, json: bool) -> Result<i32> {
    let thread = engine.thread(id).await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&thread).context("serialize thread")?
        );
        return Ok(exit_codes::OK);
    }

    println!("{}", summary_line(&thread));
    if let Some(branch) = &thread.branch {
        println!("branch: {branch}");
    }
    if thread.unsandboxed {
        println!("sandbox: none (ran on host)");
    }
    if let Some(reason) = &thread.failure {
        println!("failure: {reason}");
    }
    println!();
    for message in thread.transcript.messages() {
        let role = message.role.as_str();
        match &message.content {
            Content::ToolCalls { text, calls } => {
                if !text.is_empty() {
                    println!("[{role}] {text}");
                }
                for call in calls {
                    println!("[{role}] call {} {}({})", call.id, call.name, call.arguments);
                }
            }
            Content::ToolResult { result } => {
                println!(
                    "[{role}] result {} {:?} ({} bytes)",
                    result.correlation_id, result.status, result.size
                );
            }
            Content::Text { text } => println!("[{role}] {text}"),
        }
    }

    if diff {
        let changes = engine.changes(id).await?;
        if changes.is_empty() {
            println!("\nno changes");
        }
        for change in changes {
            println!("\n--- {}", change.path);
            print!("{}", change.diff);
        }
    }
    Ok(exit_codes::OK)
}

async fn cmd_merge(engine: &Engine, id: &ThreadId) -> Result<i32> {
    match engine.finish(id).await? {
        MergeOutcome::FastForward { commit } => {
            println!("fast-forwarded to {commit}");
            Ok(exit_codes::OK)
        }
        MergeOutcome::Merged { commit } => {
            println!("merged as {commit}");
            Ok(exit_codes::OK)
        }
        MergeOutcome::Conflict { paths } => {
            eprintln!("merge conflict, branch kept:");
            for path in paths {
                eprintln!("  {path}");
            }
            Ok(exit_codes::CONFLICT)
        }
    }
}
