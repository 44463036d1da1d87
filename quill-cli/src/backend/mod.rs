//! Backend stream client abstraction.
//!
//! A [`Backend`] opens streaming chat requests against a model backend and
//! yields [`StreamEvent`]s until exactly one terminal event (success or
//! failure) is produced, on every path including cancellation. Retries are
//! the caller's responsibility; the client performs none.

mod ollama;

pub use ollama::OllamaBackend;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use quill_common::{Error, Result};

/// One message as sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// A chat request: model, full message sequence, sampling parameters, and
/// the streamed/single-shot delivery flag.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub stream: bool,
    /// Deadline for the initial response and for each subsequent event
    pub timeout: Duration,
}

/// Final token counts reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A transient unit of streamed output.
///
/// Never persisted; the engine folds a completed stream into a message.
#[derive(Debug)]
pub enum StreamEvent {
    /// Incremental text fragment
    Delta(String),
    /// Terminal success marker with final token counts
    Done(Usage),
    /// Terminal failure marker
    Failed(Error),
}

/// Result of a non-streamed (single-shot) request.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Single-pass, push-style event sequence for one opened request.
///
/// Dropping the stream releases the underlying connection.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Streaming chat backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logs and display.
    fn name(&self) -> &str;

    /// Open a streaming request.
    ///
    /// The returned stream yields zero or more [`StreamEvent::Delta`]s
    /// followed by exactly one terminal event. Cancelling `cancel` is
    /// observed between event deliveries and yields a terminal
    /// [`StreamEvent::Failed`] with [`Error::Cancelled`].
    fn open(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream;

    /// Issue a non-streamed request and wait for the full response.
    async fn complete(&self, request: ChatRequest) -> Result<Completion>;
}
