//! Interactive chat REPL.
//!
//! Thin collaborator shell over the engine: reads lines, routes slash
//! commands to engine operations, prints streamed deltas from the live
//! view, and turns Ctrl-C into a cooperative cancel of the in-flight
//! exchange. Rendering is plain text by design.

use std::future::Future;
use std::io::Write as _;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use dialoguer::Confirm;
use tokio::io::{AsyncBufReadExt, BufReader};

use quill_common::Error;

use crate::engine::{ChatEngine, ExchangeOutcome};

const HELP: &str = "\
/help            show this help
/save [title]    persist the session (optionally retitle)
/sessions        list saved sessions
/load <id>       load a saved session
/delete <id>     delete a saved session
/new             start a fresh session
/retry           regenerate the last reply
/edit <text>     rewrite the last user turn and regenerate
/tags <a,b,c>    replace session tags
/quit            exit";

/// Line-based REPL driving one engine.
pub struct Repl {
    engine: Arc<ChatEngine>,
    show_metrics: bool,
}

impl Repl {
    pub fn new(engine: Arc<ChatEngine>, show_metrics: bool) -> Self {
        Self {
            engine,
            show_metrics,
        }
    }

    pub async fn run(&self) -> Result<()> {
        println!(
            "{}",
            style("Quill — /help for commands, /quit to exit").dim()
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{} ", style("❯").cyan().bold());
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                break; // EOF
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(command) = line.strip_prefix('/') {
                if !self.handle_command(command).await? {
                    break;
                }
            } else {
                self.drive(self.engine.start_exchange(line, None)).await;
            }
        }
        Ok(())
    }

    /// Run one exchange while mirroring the live view to the terminal.
    async fn drive<F>(&self, exchange: F)
    where
        F: Future<Output = quill_common::Result<ExchangeOutcome>>,
    {
        let mut view = self.engine.live_view();
        let mut printed = 0usize;
        tokio::pin!(exchange);

        let outcome = loop {
            tokio::select! {
                result = &mut exchange => break result,
                changed = view.changed() => {
                    if changed.is_ok() {
                        let snapshot = view.borrow_and_update();
                        if snapshot.text.len() > printed {
                            print!("{}", &snapshot.text[printed..]);
                            printed = snapshot.text.len();
                            let _ = std::io::stdout().flush();
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    self.engine.cancel_current();
                }
            }
        };

        // Flush any tail delivered between the last print and completion.
        {
            let snapshot = view.borrow();
            if snapshot.text.len() > printed {
                print!("{}", &snapshot.text[printed..]);
                let _ = std::io::stdout().flush();
            }
        }
        println!();

        match outcome {
            Ok(outcome) => {
                if outcome.reply.interrupted {
                    println!("{}", style("◼ interrupted").yellow());
                }
                if outcome.summarized {
                    println!("{}", style("(older history summarized)").dim());
                }
                if self.show_metrics {
                    println!(
                        "{}",
                        style(format!(
                            "⏱ {:.1}s  ◈ {} tokens  ⚡ {:.1} tok/s",
                            outcome.elapsed.as_secs_f64(),
                            outcome.usage.completion_tokens,
                            outcome.tokens_per_second
                        ))
                        .dim()
                    );
                }
            }
            Err(Error::Cancelled) => {
                println!("{}", style("◼ cancelled").yellow());
            }
            Err(err) => {
                eprintln!("{} {err}", style("error:").red().bold());
            }
        }
        println!();
    }

    /// Returns false when the REPL should exit.
    async fn handle_command(&self, command: &str) -> Result<bool> {
        let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
        let rest = rest.trim();

        match name {
            "help" => println!("{HELP}"),
            "quit" | "exit" => return Ok(false),
            "save" => {
                let title = (!rest.is_empty()).then(|| rest.to_string());
                match self.engine.save_as(title).await {
                    Ok(()) => {
                        let session = self.engine.session_snapshot().await;
                        println!("saved {}", session.id);
                    }
                    Err(err) => eprintln!("{} {err}", style("error:").red().bold()),
                }
            }
            "sessions" => match self.engine.list_sessions() {
                Ok(sessions) if sessions.is_empty() => println!("no saved sessions"),
                Ok(sessions) => {
                    for meta in sessions {
                        println!(
                            "{}  {}  {}  {} msgs{}",
                            meta.id,
                            style(meta.title.as_deref().unwrap_or("(untitled)")).bold(),
                            meta.model,
                            meta.message_count,
                            if meta.encrypted { "  [encrypted]" } else { "" },
                        );
                    }
                }
                Err(err) => eprintln!("{} {err}", style("error:").red().bold()),
            },
            "load" => {
                if rest.is_empty() {
                    println!("usage: /load <id>");
                } else if let Err(err) = self.engine.load_session(rest).await {
                    eprintln!("{} {err}", style("error:").red().bold());
                } else {
                    println!("loaded {rest}");
                }
            }
            "delete" => {
                if rest.is_empty() {
                    println!("usage: /delete <id>");
                } else if Confirm::new()
                    .with_prompt(format!("Delete session {rest}?"))
                    .default(false)
                    .interact()?
                {
                    if let Err(err) = self.engine.delete_session(rest) {
                        eprintln!("{} {err}", style("error:").red().bold());
                    }
                }
            }
            "new" => {
                if let Err(err) = self.engine.new_session().await {
                    eprintln!("{} {err}", style("error:").red().bold());
                }
            }
            "retry" => self.drive(self.engine.retry_last()).await,
            "edit" => {
                if rest.is_empty() {
                    println!("usage: /edit <text>");
                } else {
                    self.drive(self.engine.edit_last(rest)).await;
                }
            }
            "tags" => {
                let tags = rest
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(String::from);
                self.engine.set_tags(tags).await.ok();
            }
            _ => println!("unknown command: /{name} (try /help)"),
        }

        Ok(true)
    }
}
