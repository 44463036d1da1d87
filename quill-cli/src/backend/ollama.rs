//! Ollama backend client.
//!
//! Speaks the `/api/chat` protocol of a local Ollama instance: a streamed
//! response is a sequence of newline-delimited JSON objects, each carrying
//! an incremental content fragment, with aggregate token counts on the
//! final `done` object.

use async_stream::stream;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use quill_common::{Error, Result};

use super::{Backend, ChatMessage, ChatRequest, Completion, EventStream, StreamEvent, Usage};

/// Client for a local Ollama-compatible backend.
pub struct OllamaBackend {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

impl OllamaBackend {
    /// Create a new client.
    ///
    /// `base_url` defaults to `http://localhost:11434`.
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn wire_request(request: &ChatRequest) -> OllamaChatRequest {
        OllamaChatRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            stream: request.stream,
            options: request
                .temperature
                .map(|temperature| OllamaOptions { temperature }),
        }
    }
}

/// Map a transport error onto the failure kinds callers dispatch on.
fn map_transport_error(err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::BackendTimeout(err.to_string())
    } else if err.is_connect() {
        Error::BackendUnreachable(format!("{err}. Is the backend running?"))
    } else if err.is_decode() {
        Error::BackendProtocol(err.to_string())
    } else {
        Error::BackendUnreachable(err.to_string())
    }
}

/// Extract the next newline-terminated line from `buf`, if any.
fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|byte| *byte == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    Some(line)
}

#[async_trait::async_trait]
impl Backend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn open(&self, mut request: ChatRequest, cancel: CancellationToken) -> EventStream {
        request.stream = true;
        let client = self.client.clone();
        let url = self.chat_url();
        let wire = Self::wire_request(&request);
        let deadline = request.timeout;
        let model = request.model;

        Box::pin(stream! {
            tracing::debug!(model = %model, url = %url, "Opening chat stream");

            let send = client.post(&url).json(&wire).send();
            let response = tokio::select! {
                () = cancel.cancelled() => {
                    yield StreamEvent::Failed(Error::Cancelled);
                    return;
                }
                outcome = tokio::time::timeout(deadline, send) => match outcome {
                    Err(_) => {
                        yield StreamEvent::Failed(Error::BackendTimeout(format!(
                            "no response within {deadline:?}"
                        )));
                        return;
                    }
                    Ok(Err(err)) => {
                        yield StreamEvent::Failed(map_transport_error(&err));
                        return;
                    }
                    Ok(Ok(response)) => response,
                },
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield StreamEvent::Failed(Error::BackendProtocol(format!(
                    "HTTP {status}: {body}"
                )));
                return;
            }

            // Dropping `body` on any exit below releases the connection.
            let mut body = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        yield StreamEvent::Failed(Error::Cancelled);
                        return;
                    }
                    outcome = tokio::time::timeout(deadline, body.next()) => outcome,
                };

                let bytes = match chunk {
                    Err(_) => {
                        yield StreamEvent::Failed(Error::BackendTimeout(format!(
                            "no stream event within {deadline:?}"
                        )));
                        return;
                    }
                    Ok(None) => {
                        yield StreamEvent::Failed(Error::BackendProtocol(
                            "stream ended without a done marker".into(),
                        ));
                        return;
                    }
                    Ok(Some(Err(err))) => {
                        yield StreamEvent::Failed(map_transport_error(&err));
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };

                buf.extend_from_slice(&bytes);

                while let Some(line) = take_line(&mut buf) {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }

                    let parsed: OllamaChunk = match serde_json::from_slice(&line) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            yield StreamEvent::Failed(Error::BackendProtocol(format!(
                                "malformed stream object: {err}"
                            )));
                            return;
                        }
                    };

                    if let Some(message) = parsed.message {
                        if !message.content.is_empty() {
                            yield StreamEvent::Delta(message.content);
                        }
                    }

                    if parsed.done {
                        yield StreamEvent::Done(Usage {
                            prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
                            completion_tokens: parsed.eval_count.unwrap_or(0),
                        });
                        return;
                    }
                }
            }
        })
    }

    async fn complete(&self, mut request: ChatRequest) -> Result<Completion> {
        request.stream = false;
        let wire = Self::wire_request(&request);
        let url = self.chat_url();

        let send = self.client.post(&url).json(&wire).send();
        let response = tokio::time::timeout(request.timeout, send)
            .await
            .map_err(|_| {
                Error::BackendTimeout(format!("no response within {:?}", request.timeout))
            })?
            .map_err(|err| map_transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::BackendProtocol(format!("HTTP {status}: {body}")));
        }

        let parsed: OllamaChunk = response
            .json()
            .await
            .map_err(|err| Error::BackendProtocol(format!("malformed response: {err}")))?;

        let content = parsed
            .message
            .map(|message| message.content)
            .unwrap_or_default();

        Ok(Completion {
            content,
            usage: Usage {
                prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
                completion_tokens: parsed.eval_count.unwrap_or(0),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_url() {
        let backend = OllamaBackend::new(None);
        assert_eq!(backend.chat_url(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_custom_url_trailing_slash() {
        let backend = OllamaBackend::new(Some("http://192.168.1.20:11434/"));
        assert_eq!(backend.base_url, "http://192.168.1.20:11434");
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "llama3".into(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: "You are concise.".into(),
                    images: None,
                },
                ChatMessage {
                    role: "user".into(),
                    content: "hello".into(),
                    images: Some(vec!["aGk=".into()]),
                },
            ],
            temperature: Some(0.7),
            stream: true,
            timeout: std::time::Duration::from_secs(30),
        };

        let json = serde_json::to_string(&OllamaBackend::wire_request(&request)).unwrap();
        assert!(json.contains("\"stream\":true"));
        assert!(json.contains("\"temperature\":0.7"));
        assert!(json.contains("\"images\":[\"aGk=\"]"));

        let single_shot = ChatRequest {
            stream: false,
            ..request
        };
        let json = serde_json::to_string(&OllamaBackend::wire_request(&single_shot)).unwrap();
        assert!(json.contains("\"stream\":false"));
    }

    #[test]
    fn test_options_omitted_without_temperature() {
        let request = ChatRequest {
            model: "llama3".into(),
            messages: vec![],
            temperature: None,
            stream: false,
            timeout: std::time::Duration::from_secs(30),
        };
        let json = serde_json::to_string(&OllamaBackend::wire_request(&request)).unwrap();
        assert!(!json.contains("options"));
    }

    #[test]
    fn test_chunk_deserialization() {
        let chunk: OllamaChunk =
            serde_json::from_str(r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#)
                .unwrap();
        assert_eq!(chunk.message.unwrap().content, "Hi");
        assert!(!chunk.done);

        let done: OllamaChunk = serde_json::from_str(
            r#"{"message":{"content":""},"done":true,"prompt_eval_count":12,"eval_count":34}"#,
        )
        .unwrap();
        assert!(done.done);
        assert_eq!(done.prompt_eval_count, Some(12));
        assert_eq!(done.eval_count, Some(34));
    }

    #[test]
    fn test_take_line_splits_ndjson() {
        let mut buf = b"{\"a\":1}\n{\"b\":2}\npartial".to_vec();
        assert_eq!(take_line(&mut buf).unwrap(), b"{\"a\":1}");
        assert_eq!(take_line(&mut buf).unwrap(), b"{\"b\":2}");
        assert!(take_line(&mut buf).is_none());
        assert_eq!(buf, b"partial");
    }
}
