use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use quill_cli::backend::OllamaBackend;
use quill_cli::config::Config;
use quill_cli::engine::ChatEngine;
use quill_cli::keys;
use quill_cli::repl::Repl;
use quill_cli::session::store::SessionStore;
use quill_common::logging::init_logging;
use quill_common::security::{compile_patterns, SecureStore};

/// Quill - streaming terminal chat for local LLM backends.
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(version)]
#[command(about = "Streaming terminal chat for local LLM backends", long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Model to chat with (overrides config)
    #[arg(long, short)]
    model: Option<String>,

    /// Resume a saved session by id
    #[arg(long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Generate an encryption key file for session records
    Keygen,
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    /// List saved sessions
    List,
    /// Delete a saved session
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    init_logging(&config.log_level, &config.log_format);

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(model) = cli.model {
        config.default_model = Some(model);
    }

    match cli.command {
        Some(Commands::Keygen) => {
            let dirs = Config::project_dirs()?;
            let path = keys::write_key_file(dirs.config_dir())?;
            println!("Key written to {}", path.display());
            println!("Set encryption_enabled = true in the config to use it.");
        }
        Some(Commands::Sessions { command }) => {
            let store = build_store(&config)?;
            match command {
                SessionCommands::List => {
                    for meta in store.list()? {
                        println!(
                            "{}  {}  {}  {} msgs  {}",
                            meta.id,
                            meta.title.as_deref().unwrap_or("(untitled)"),
                            meta.model,
                            meta.message_count,
                            meta.updated_at.format("%Y-%m-%d %H:%M"),
                        );
                    }
                }
                SessionCommands::Delete { id } => {
                    store.delete(&id)?;
                    println!("deleted {id}");
                }
            }
        }
        None => run_chat(config, cli.session).await?,
    }

    Ok(())
}

fn build_store(config: &Config) -> Result<SessionStore> {
    let mut store = SessionStore::new(config.sessions_dir()?)?;

    if config.encryption_enabled {
        let dirs = Config::project_dirs()?;
        let key = keys::resolve_key(dirs.config_dir())?.context(
            "encryption_enabled is set but no key was found; \
             run `quill keygen` or set QUILL_SESSION_KEY",
        )?;
        store = store.with_encryption(SecureStore::new(&key));
    }

    if config.mask_sensitive {
        store = store.with_masking(compile_patterns(&config.mask_patterns));
    }

    Ok(store)
}

async fn run_chat(config: Config, session_id: Option<String>) -> Result<()> {
    let Some(model) = config.default_model.clone() else {
        bail!("no model configured; pass --model or set default_model in the config");
    };

    let store = build_store(&config)?;
    let backend = Arc::new(OllamaBackend::new(Some(&config.host)));

    let engine = if let Some(id) = session_id {
        let session = store.load(&id)?;
        ChatEngine::with_session(config.engine_config(), backend, store, session)
    } else {
        ChatEngine::new(config.engine_config(), backend, store, &model)
    };

    Repl::new(Arc::new(engine), config.show_metrics).run().await
}
