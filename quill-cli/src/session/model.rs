//! Conversation session data model.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quill_common::tokens::{estimate_text, IMAGE_TOKENS, MESSAGE_OVERHEAD};

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction (summaries and prompts are sent with this role)
    System,
    /// User message
    User,
    /// Assistant response
    Assistant,
}

impl Role {
    /// Wire-format string for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single conversational turn.
///
/// Immutable once its exchange completes; the engine replaces (retry) or
/// rewrites (edit) trailing messages as whole values instead of mutating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Opaque image reference forwarded to the backend untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set when a cancellation preserved partially streamed text
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    /// Cached token estimate; recomputed lazily, never persisted
    #[serde(skip)]
    token_estimate: OnceLock<usize>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image: None,
            timestamp: Utc::now(),
            interrupted: false,
            token_estimate: OnceLock::new(),
        }
    }

    pub fn user(content: impl Into<String>, image: Option<String>) -> Self {
        let mut message = Self::new(Role::User, content);
        message.image = image;
        message
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Copy of this message with different content and a reset estimate.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            role: self.role,
            content: content.into(),
            image: self.image.clone(),
            timestamp: self.timestamp,
            interrupted: self.interrupted,
            token_estimate: OnceLock::new(),
        }
    }

    /// Token estimate for this message's content (framing overhead is
    /// charged per message by [`estimate_messages`]).
    pub fn token_estimate(&self) -> usize {
        *self.token_estimate.get_or_init(|| {
            let image_tokens = if self.image.is_some() { IMAGE_TOKENS } else { 0 };
            estimate_text(&self.content) + image_tokens
        })
    }
}

// The cached estimate is derived state and excluded from equality.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.content == other.content
            && self.image == other.image
            && self.timestamp == other.timestamp
            && self.interrupted == other.interrupted
    }
}

impl Eq for Message {}

/// Estimate for a sequence of messages, including per-message framing.
pub fn estimate_messages<'a>(messages: impl IntoIterator<Item = &'a Message>) -> usize {
    messages
        .into_iter()
        .map(|message| message.token_estimate() + MESSAGE_OVERHEAD)
        .sum()
}

/// Cumulative token usage across a session's exchanges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenStats {
    /// Fold one exchange's final counts into the running totals.
    pub fn record(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.total_tokens += prompt_tokens + completion_tokens;
    }
}

/// One conversation: ordered user/assistant turns plus metadata.
///
/// The system prompt and running summary live outside the message list and
/// are joined in at request-build time, so the list only ever holds actual
/// turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Compressed representation of elided older history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Optimistic-concurrency counter, bumped on every persisted save
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub stats: TokenStats,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: None,
            tags: BTreeSet::new(),
            model: model.into(),
            created_at: now,
            updated_at: now,
            summary: None,
            revision: 0,
            stats: TokenStats::default(),
            messages: Vec::new(),
        }
    }

    /// Total context estimate: system prompt + running summary + messages.
    pub fn context_estimate(&self, system_prompt: &str) -> usize {
        let mut total = estimate_messages(&self.messages);
        if !system_prompt.is_empty() {
            total += estimate_text(system_prompt) + MESSAGE_OVERHEAD;
        }
        if let Some(summary) = &self.summary {
            total += estimate_text(summary) + MESSAGE_OVERHEAD;
        }
        total
    }

    /// Derive a title from the first user message's leading text.
    pub fn derive_title(&self) -> Option<String> {
        let first = self
            .messages
            .iter()
            .find(|message| message.role == Role::User)?;
        let line = first.content.lines().find(|line| !line.trim().is_empty())?;
        let trimmed = line.trim();

        let mut title: String = trimmed.chars().take(48).collect();
        if title.chars().count() < trimmed.chars().count() {
            title.push('…');
        }
        Some(title)
    }
}

/// Listing entry describing a persisted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: Option<String>,
    pub model: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub token_total: u64,
    pub tags: BTreeSet<String>,
    pub encrypted: bool,
}

impl SessionMeta {
    pub fn describe(session: &Session, encrypted: bool) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            model: session.model.clone(),
            updated_at: session.updated_at,
            message_count: session.messages.len(),
            token_total: session.stats.total_tokens,
            tags: session.tags.clone(),
            encrypted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_strings() {
        assert_eq!(Role::System.as_str(), "system");
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn test_message_estimate_cached_and_excluded_from_eq() {
        let message = Message::user("abcdefgh", None);
        assert_eq!(message.token_estimate(), 2);

        // A clone that never computed its estimate still compares equal.
        let mut other = message.clone();
        other.token_estimate = OnceLock::new();
        assert_eq!(message, other);
    }

    #[test]
    fn test_image_adds_flat_estimate() {
        let plain = Message::user("hello", None);
        let with_image = Message::user("hello", Some("img-1".into()));
        assert_eq!(
            with_image.token_estimate(),
            plain.token_estimate() + IMAGE_TOKENS
        );
    }

    #[test]
    fn test_sequence_estimate_charges_overhead() {
        let messages = vec![Message::user("abcd", None), Message::assistant("efgh")];
        assert_eq!(estimate_messages(&messages), 2 * (1 + MESSAGE_OVERHEAD));
    }

    #[test]
    fn test_context_estimate_includes_summary_and_system() {
        let mut session = Session::new("llama3");
        session.messages.push(Message::user("abcd", None));
        let base = session.context_estimate("");

        session.summary = Some("abcdefgh".to_string());
        assert_eq!(
            session.context_estimate(""),
            base + 2 + MESSAGE_OVERHEAD
        );
        assert_eq!(
            session.context_estimate("abcd"),
            base + 2 + MESSAGE_OVERHEAD + 1 + MESSAGE_OVERHEAD
        );
    }

    #[test]
    fn test_derive_title_from_first_user_line() {
        let mut session = Session::new("llama3");
        assert_eq!(session.derive_title(), None);

        session
            .messages
            .push(Message::user("\nExplain lifetimes in Rust\nplease", None));
        assert_eq!(
            session.derive_title().as_deref(),
            Some("Explain lifetimes in Rust")
        );
    }

    #[test]
    fn test_derive_title_truncates_long_input() {
        let mut session = Session::new("llama3");
        session.messages.push(Message::user("x".repeat(100), None));
        let title = session.derive_title().unwrap();
        assert_eq!(title.chars().count(), 49);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn test_token_stats_record() {
        let mut stats = TokenStats::default();
        stats.record(10, 5);
        stats.record(2, 3);
        assert_eq!(stats.prompt_tokens, 12);
        assert_eq!(stats.completion_tokens, 8);
        assert_eq!(stats.total_tokens, 20);
    }
}
