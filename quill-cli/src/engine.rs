//! Conversation session engine.
//!
//! Owns one live session and drives each exchange through its state
//! machine: budget check, optional summarization, streaming, commit.
//! Exactly one exchange runs at a time; a second caller gets `Busy`.
//! Read-only observers follow the in-flight exchange through a watch
//! channel and never touch engine state.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use quill_common::tokens::estimate_text;
use quill_common::{Error, Result};

use crate::backend::{Backend, ChatMessage, ChatRequest, StreamEvent, Usage};
use crate::session::budget::{BudgetController, BudgetDecision};
use crate::session::model::{Message, Role, Session, SessionMeta};
use crate::session::store::SessionStore;

/// Summarization passes per exchange before hard truncation takes over.
const MAX_SUMMARY_PASSES: usize = 1;

/// Engine configuration, resolved once at construction and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub system_prompt: String,
    /// Maximum token estimate for material sent to the backend
    pub budget: usize,
    /// Most recent messages never summarized away
    pub keep_last_n: usize,
    pub autosummarize: bool,
    /// Distinct model for summarization requests (main model when unset)
    pub summary_model: Option<String>,
    /// Instruction prompt for the summarizer
    pub summary_prompt: String,
    pub temperature: Option<f64>,
    pub request_timeout: Duration,
    /// Persist after every committed exchange
    pub autosave: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            budget: 8192,
            keep_last_n: 6,
            autosummarize: true,
            summary_model: None,
            summary_prompt: "Write a short, structured summary of the conversation. \
                             Keep technical terms, drop filler. Use bullet points where helpful."
                .to_string(),
            temperature: None,
            request_timeout: Duration::from_secs(300),
            autosave: true,
        }
    }
}

/// Where the current exchange is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePhase {
    #[default]
    Idle,
    BudgetCheck,
    Summarizing,
    Streaming,
    Committing,
}

/// Read-only snapshot of the in-flight exchange for a live display.
#[derive(Debug, Clone, Default)]
pub struct LiveView {
    pub phase: ExchangePhase,
    /// Partial assistant text, appended to as deltas arrive
    pub text: String,
    /// Running rate computed from event arrival times
    pub tokens_per_second: f64,
    pub interrupted: bool,
}

/// Result of one completed exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub reply: Message,
    pub usage: Usage,
    pub elapsed: Duration,
    pub tokens_per_second: f64,
    /// Whether this exchange compressed older history
    pub summarized: bool,
}

/// The conversation session engine.
///
/// Methods take `&self`; the engine is meant to be shared (`Arc`) between
/// the driving task and observers issuing `cancel_current`.
pub struct ChatEngine {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    store: SessionStore,
    session: Mutex<Session>,
    phase: StdMutex<ExchangePhase>,
    cancel: StdMutex<Option<CancellationToken>>,
    live: watch::Sender<LiveView>,
}

impl ChatEngine {
    /// Create an engine with a fresh session for `model`.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn Backend>,
        store: SessionStore,
        model: &str,
    ) -> Self {
        Self::with_session(config, backend, store, Session::new(model))
    }

    /// Create an engine owning an existing session.
    pub fn with_session(
        config: EngineConfig,
        backend: Arc<dyn Backend>,
        store: SessionStore,
        session: Session,
    ) -> Self {
        let (live, _) = watch::channel(LiveView::default());
        Self {
            config,
            backend,
            store,
            session: Mutex::new(session),
            phase: StdMutex::new(ExchangePhase::Idle),
            cancel: StdMutex::new(None),
            live,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to the live view of the current exchange.
    pub fn live_view(&self) -> watch::Receiver<LiveView> {
        self.live.subscribe()
    }

    /// Current exchange phase.
    pub fn phase(&self) -> ExchangePhase {
        *self.lock_phase()
    }

    /// Clone of the owned session (for display and tests).
    pub async fn session_snapshot(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Request cooperative cancellation of the in-flight stream.
    pub fn cancel_current(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = cancel.as_ref() {
            token.cancel();
        }
    }

    /// Run one exchange for a new user turn.
    pub async fn start_exchange(
        &self,
        text: &str,
        image: Option<String>,
    ) -> Result<ExchangeOutcome> {
        let _guard = self.begin_exchange()?;
        let mut session = self.session.lock().await;
        session.messages.push(Message::user(text, image));
        self.run_exchange(&mut session).await
    }

    /// Discard the last assistant reply and re-run the preceding turn.
    pub async fn retry_last(&self) -> Result<ExchangeOutcome> {
        let _guard = self.begin_exchange()?;
        let mut session = self.session.lock().await;

        if session.messages.last().map(|message| message.role) == Some(Role::Assistant) {
            session.messages.pop();
        }
        if session.messages.last().map(|message| message.role) != Some(Role::User) {
            return Err(Error::NotFound("no user turn to retry".into()));
        }

        self.run_exchange(&mut session).await
    }

    /// Rewrite the last user turn, discard the reply after it, and re-run.
    pub async fn edit_last(&self, new_text: &str) -> Result<ExchangeOutcome> {
        let _guard = self.begin_exchange()?;
        let mut session = self.session.lock().await;

        if session.messages.last().map(|message| message.role) == Some(Role::Assistant) {
            session.messages.pop();
        }
        let Some(last) = session.messages.last_mut() else {
            return Err(Error::NotFound("no user turn to edit".into()));
        };
        if last.role != Role::User {
            return Err(Error::NotFound("no user turn to edit".into()));
        }
        *last = last.with_content(new_text);

        self.run_exchange(&mut session).await
    }

    /// Persist the owned session, optionally setting its title first.
    pub async fn save_as(&self, title: Option<String>) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(title) = title {
            session.title = Some(title);
        }
        self.store.save(&mut session)
    }

    /// Replace the owned session with tags.
    pub async fn set_tags(&self, tags: impl IntoIterator<Item = String>) -> Result<()> {
        let mut session = self.session.lock().await;
        session.tags = tags.into_iter().collect();
        Ok(())
    }

    /// Swap in a persisted session. Rejected while an exchange runs.
    pub async fn load_session(&self, id: &str) -> Result<()> {
        if self.phase() != ExchangePhase::Idle {
            return Err(Error::Busy);
        }
        let loaded = self.store.load(id)?;
        *self.session.lock().await = loaded;
        Ok(())
    }

    /// Start over with a fresh session on the same model.
    pub async fn new_session(&self) -> Result<()> {
        if self.phase() != ExchangePhase::Idle {
            return Err(Error::Busy);
        }
        let mut session = self.session.lock().await;
        *session = Session::new(session.model.clone());
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        self.store.list()
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.store.delete(id)
    }

    // ------------------------------------------------------------------
    // Exchange state machine
    // ------------------------------------------------------------------

    fn lock_phase(&self) -> MutexGuard<'_, ExchangePhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the engine for one exchange, or report `Busy`.
    fn begin_exchange(&self) -> Result<PhaseGuard<'_>> {
        {
            let mut phase = self.lock_phase();
            if *phase != ExchangePhase::Idle {
                return Err(Error::Busy);
            }
            *phase = ExchangePhase::BudgetCheck;
        }
        self.live.send_replace(LiveView {
            phase: ExchangePhase::BudgetCheck,
            ..LiveView::default()
        });
        Ok(PhaseGuard { engine: self })
    }

    fn set_phase(&self, phase: ExchangePhase) {
        *self.lock_phase() = phase;
        self.live.send_modify(|view| view.phase = phase);
    }

    async fn run_exchange(&self, session: &mut Session) -> Result<ExchangeOutcome> {
        let summarized = self.enforce_budget(session).await?;

        self.set_phase(ExchangePhase::Streaming);
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let request = self.build_request(session, true);
        let mut stream = self.backend.open(request, cancel);

        let started = Instant::now();
        let mut text = String::new();
        let mut terminal = None;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta(delta) => {
                    text.push_str(&delta);
                    let elapsed = started.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 {
                        estimate_text(&text) as f64 / elapsed
                    } else {
                        0.0
                    };
                    self.live.send_modify(|view| {
                        view.text.push_str(&delta);
                        view.tokens_per_second = rate;
                    });
                }
                StreamEvent::Done(usage) => {
                    terminal = Some(Ok(usage));
                    break;
                }
                StreamEvent::Failed(err) => {
                    terminal = Some(Err(err));
                    break;
                }
            }
        }
        drop(stream);
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let elapsed = started.elapsed();
        let (reply, usage) = match terminal {
            Some(Ok(usage)) => (Message::assistant(text), usage),
            Some(Err(Error::Cancelled)) => {
                if text.is_empty() {
                    // Nothing arrived; treat like any other failed exchange.
                    return Err(Error::Cancelled);
                }
                let mut reply = Message::assistant(text);
                reply.interrupted = true;
                self.live.send_modify(|view| view.interrupted = true);
                let usage = Usage {
                    prompt_tokens: 0,
                    completion_tokens: estimate_text(&reply.content) as u64,
                };
                (reply, usage)
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(Error::BackendProtocol(
                    "stream ended without a terminal event".into(),
                ))
            }
        };

        self.commit(session, reply.clone(), usage).await?;

        let seconds = elapsed.as_secs_f64();
        let tokens_per_second = if seconds > 0.0 {
            usage.completion_tokens as f64 / seconds
        } else {
            0.0
        };

        Ok(ExchangeOutcome {
            reply,
            usage,
            elapsed,
            tokens_per_second,
            summarized,
        })
    }

    /// Summarize-then-recheck until the context fits, with hard truncation
    /// as the bounded fallback.
    async fn enforce_budget(&self, session: &mut Session) -> Result<bool> {
        let controller = BudgetController::new(self.config.budget, self.config.keep_last_n);
        let mut summarized = false;

        for pass in 0..=MAX_SUMMARY_PASSES {
            match controller.check(session, &self.config.system_prompt) {
                BudgetDecision::Within { estimate } => {
                    tracing::debug!(estimate, budget = self.config.budget, "Context within budget");
                    return Ok(summarized);
                }
                BudgetDecision::NeedsSummarization {
                    to_summarize, keep, ..
                } => {
                    if !self.config.autosummarize
                        || to_summarize.is_empty()
                        || pass == MAX_SUMMARY_PASSES
                    {
                        break;
                    }

                    self.set_phase(ExchangePhase::Summarizing);
                    tracing::info!(
                        candidates = to_summarize.len(),
                        kept = keep.len(),
                        "Summarizing older history"
                    );
                    let summary = self
                        .request_summary(&session.model, session.summary.as_deref(), &to_summarize)
                        .await?;
                    session.summary = Some(controller.clamp_summary(&summary));
                    session.messages = keep;
                    summarized = true;
                    self.set_phase(ExchangePhase::BudgetCheck);
                }
            }
        }

        let dropped = controller.truncate_to_fit(session, &self.config.system_prompt)?;
        if dropped > 0 {
            tracing::warn!(dropped, "Hard-truncated oldest messages to fit the budget");
        }
        Ok(summarized)
    }

    async fn request_summary(
        &self,
        model: &str,
        previous: Option<&str>,
        messages: &[Message],
    ) -> Result<String> {
        let input = BudgetController::summary_input(previous, messages);
        let request = ChatRequest {
            model: self
                .config
                .summary_model
                .clone()
                .unwrap_or_else(|| model.to_string()),
            messages: vec![
                ChatMessage {
                    role: Role::System.as_str().to_string(),
                    content: self.config.summary_prompt.clone(),
                    images: None,
                },
                ChatMessage {
                    role: Role::User.as_str().to_string(),
                    content: input,
                    images: None,
                },
            ],
            temperature: Some(0.3),
            stream: false,
            timeout: self.config.request_timeout,
        };

        let completion = self.backend.complete(request).await?;
        let summary = completion.content.trim().to_string();
        if summary.is_empty() {
            return Err(Error::BackendProtocol("summarizer returned nothing".into()));
        }
        Ok(summary)
    }

    fn build_request(&self, session: &Session, stream: bool) -> ChatRequest {
        let mut messages = Vec::with_capacity(session.messages.len() + 2);

        if !self.config.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: Role::System.as_str().to_string(),
                content: self.config.system_prompt.clone(),
                images: None,
            });
        }
        if let Some(summary) = &session.summary {
            messages.push(ChatMessage {
                role: Role::System.as_str().to_string(),
                content: format!("Summary of the earlier conversation:\n{summary}"),
                images: None,
            });
        }
        for message in &session.messages {
            messages.push(ChatMessage {
                role: message.role.as_str().to_string(),
                content: message.content.clone(),
                images: message.image.clone().map(|image| vec![image]),
            });
        }

        ChatRequest {
            model: session.model.clone(),
            messages,
            temperature: self.config.temperature,
            stream,
            timeout: self.config.request_timeout,
        }
    }

    async fn commit(&self, session: &mut Session, reply: Message, usage: Usage) -> Result<()> {
        self.set_phase(ExchangePhase::Committing);

        session.messages.push(reply);
        if session.title.is_none() {
            session.title = session.derive_title();
        }
        session.stats.record(usage.prompt_tokens, usage.completion_tokens);

        // Re-enforce the budget with the reply folded in, so the invariant
        // holds after the exchange, not just before the request. A
        // summarizer failure here must not lose the completed exchange, so
        // it degrades to truncation.
        if let Err(err) = self.enforce_budget(session).await {
            if matches!(err, Error::BudgetExceeded(_)) {
                return Err(err);
            }
            tracing::warn!(error = %err, "Post-exchange summarization failed; truncating");
            let controller = BudgetController::new(self.config.budget, self.config.keep_last_n);
            controller.truncate_to_fit(session, &self.config.system_prompt)?;
        }

        if !self.config.autosave {
            return Ok(());
        }

        match self.store.save(session) {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => {
                tracing::warn!(id = %session.id, "Save conflict; reloading and reapplying");
                let persisted = self.store.load(&session.id)?;
                let merged = reapply_exchange(persisted, session);
                *session = merged;
                self.store.save(session)
            }
            Err(err) => Err(err),
        }
    }
}

/// Merge the just-completed exchange onto a freshly reloaded session.
///
/// The reloaded record wins for anything another writer already persisted;
/// this exchange's messages, summary, tags, and counters are layered on
/// top without clobbering.
fn reapply_exchange(mut persisted: Session, current: &Session) -> Session {
    for message in &current.messages {
        if !persisted.messages.contains(message) {
            persisted.messages.push(message.clone());
        }
    }
    if current.summary.is_some() {
        persisted.summary = current.summary.clone();
    }
    if persisted.title.is_none() {
        persisted.title = current.title.clone();
    }
    persisted.tags.extend(current.tags.iter().cloned());
    persisted.stats.prompt_tokens = persisted.stats.prompt_tokens.max(current.stats.prompt_tokens);
    persisted.stats.completion_tokens = persisted
        .stats
        .completion_tokens
        .max(current.stats.completion_tokens);
    persisted.stats.total_tokens = persisted.stats.total_tokens.max(current.stats.total_tokens);
    persisted
}

/// Resets the engine to `Idle` when an exchange ends, however it ends.
struct PhaseGuard<'a> {
    engine: &'a ChatEngine,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.engine.set_phase(ExchangePhase::Idle);
        *self
            .engine
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.budget, 8192);
        assert_eq!(config.keep_last_n, 6);
        assert!(config.autosummarize);
        assert!(config.autosave);
        assert!(config.summary_model.is_none());
    }

    #[test]
    fn test_reapply_keeps_other_writers_data() {
        let mut persisted = Session::new("llama3");
        persisted.messages.push(Message::user("their turn", None));
        persisted.tags.insert("theirs".into());
        persisted.revision = 2;

        let mut current = persisted.clone();
        current.revision = 1; // stale view
        current.messages.push(Message::user("our turn", None));
        current.messages.push(Message::assistant("our reply"));
        current.tags.insert("ours".into());
        current.title = Some("Our title".into());

        let merged = reapply_exchange(persisted, &current);
        assert_eq!(merged.revision, 2);
        assert_eq!(merged.messages.len(), 3);
        assert!(merged.messages.iter().any(|m| m.content == "their turn"));
        assert!(merged.messages.iter().any(|m| m.content == "our reply"));
        assert!(merged.tags.contains("theirs") && merged.tags.contains("ours"));
        assert_eq!(merged.title.as_deref(), Some("Our title"));
    }

    #[test]
    fn test_reapply_does_not_duplicate_shared_history() {
        let mut persisted = Session::new("llama3");
        let shared = Message::user("shared", None);
        persisted.messages.push(shared.clone());

        let mut current = Session::new("llama3");
        current.id = persisted.id.clone();
        current.messages.push(shared);
        current.messages.push(Message::assistant("new reply"));

        let merged = reapply_exchange(persisted, &current);
        assert_eq!(merged.messages.len(), 2);
    }
}
