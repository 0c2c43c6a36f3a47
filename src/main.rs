//! # Knowledge Chat CLI (`kchat`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kchat serve` | Start the chat widget HTTP server |
//! | `kchat knowledge set` | Replace the knowledge blob from files and/or text |
//! | `kchat knowledge show` | Print the current knowledge blob |
//! | `kchat ask "<question>"` | Ask a single question |
//! | `kchat chat` | Interactive chat on stdin |
//! | `kchat completions <shell>` | Print shell completions |
//!
//! ## Environment
//!
//! - `OPENROUTER_API_KEY` (or `[completion].api_key_env`): required by
//!   `serve`, `ask`, and `chat`.
//! - `KCHAT_ADMIN_SECRET` (or `[admin].secret_env`): required by `serve`.
//! - `RUST_LOG`: log filter, default `info`.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use knowledge_chat::chat::ChatLoop;
use knowledge_chat::completion::CompletionClient;
use knowledge_chat::config::{self, Config, Secrets};
use knowledge_chat::export;
use knowledge_chat::ingest::{self, IngestError, IngestFailure, Upload};
use knowledge_chat::knowledge::KnowledgeStore;
use knowledge_chat::server;
use knowledge_chat::session::Session;

/// Knowledge Chat: answer questions from an admin-managed knowledge snippet.
#[derive(Parser)]
#[command(name = "kchat", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "./config/kchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (chat widget + admin panel).
    Serve,

    /// Manage the knowledge blob.
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Ask one question against the current knowledge.
    Ask {
        question: String,
    },

    /// Chat interactively on stdin; one question per line.
    Chat {
        /// Write the Question/Answer/Timestamp log here on exit.
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Generate shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum KnowledgeAction {
    /// Replace the knowledge blob with the given documents and text.
    ///
    /// Documents are concatenated in the order given; the text follows
    /// after a blank line. The result is truncated to `knowledge.max_chars`.
    Set {
        /// PDF, .txt or .md file; repeatable.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Pasted knowledge text.
        #[arg(long)]
        text: Option<String>,
    },
    /// Print the current knowledge blob.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "kchat", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let secrets = Secrets::from_env(&cfg)?;
            server::run_server(&cfg, secrets).await?;
        }
        Commands::Knowledge { action } => match action {
            KnowledgeAction::Set { files, text } => set_knowledge(&cfg, &files, text.as_deref())?,
            KnowledgeAction::Show => {
                let store = KnowledgeStore::from_config(&cfg.knowledge);
                let text = store.load()?;
                if text.is_empty() {
                    eprintln!("No knowledge uploaded.");
                } else {
                    println!("{}", text);
                }
            }
        },
        Commands::Ask { question } => {
            let chat = cli_chat_loop(&cfg)?;
            let mut session = Session::new("", cfg.chat.max_history);
            let outcome = chat.handle_input(&mut session, &question, false).await;
            if let Some(reply) = outcome.reply() {
                println!("{}", reply);
            }
        }
        Commands::Chat { export: export_path } => {
            let chat = cli_chat_loop(&cfg)?;
            run_interactive(&cfg, &chat, export_path).await?;
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

fn cli_chat_loop(cfg: &Config) -> Result<ChatLoop> {
    let api_key = config::api_key_from_env(cfg)?;
    let client = CompletionClient::from_config(&cfg.completion, api_key)?;
    // No admin context on the command line, so no secret is needed.
    Ok(ChatLoop::new(
        cfg,
        KnowledgeStore::from_config(&cfg.knowledge),
        client,
        String::new(),
    ))
}

fn set_knowledge(cfg: &Config, files: &[PathBuf], text: Option<&str>) -> Result<()> {
    let mut uploads = Vec::with_capacity(files.len());
    let mut unreadable = Vec::new();
    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match std::fs::read(path) {
            Ok(bytes) => uploads.push(Upload::new(file_name, "", bytes)),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping unreadable file");
                unreadable.push(IngestFailure {
                    file_name,
                    reason: format!("failed to read {}: {}", path.display(), e),
                });
            }
        }
    }

    let store = KnowledgeStore::from_config(&cfg.knowledge);
    match ingest::save_knowledge(&store, &uploads, text) {
        Ok(report) => {
            print_skipped(unreadable.iter().chain(&report.failures));
            println!(
                "Knowledge saved: {} chars{} -> {}",
                report.chars_saved,
                if report.truncated { " (truncated)" } else { "" },
                store.path().display()
            );
            Ok(())
        }
        Err(IngestError::NoContent { failures }) => {
            print_skipped(unreadable.iter().chain(&failures));
            anyhow::bail!("No content to save")
        }
        Err(e) => Err(e.into()),
    }
}

fn print_skipped<'a>(failures: impl Iterator<Item = &'a IngestFailure>) {
    for f in failures {
        eprintln!("  skipped {}: {}", f.file_name, f.reason);
    }
}

async fn run_interactive(cfg: &Config, chat: &ChatLoop, export_path: Option<PathBuf>) -> Result<()> {
    let mut session = Session::new(&cfg.chat.greeting, cfg.chat.max_history);
    if let Some(greeting) = session.messages().first() {
        println!("bot> {}", greeting.content);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let outcome = chat.handle_input(&mut session, &line, false).await;
        if let Some(reply) = outcome.reply() {
            println!("bot> {}", reply);
        }
    }

    if let Some(path) = export_path {
        export::export_turns_to_file(session.turns(), &path)?;
        println!("Exported {} turns to {}", session.turns().len(), path.display());
    }
    Ok(())
}
