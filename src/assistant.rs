//! Assistant collaborator
//!
//! The controller hands committed transcripts to an [`Assistant`] and reads
//! the reply back as a stream of text chunks.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default chat model
pub const DEFAULT_MODEL: &str = "gpt-4-turbo";

const SYSTEM_PROMPT: &str = "Tu es Benji, l'assistant vocal d'un agenda personnel. \
Tu aides à créer, déplacer et consulter des rendez-vous. \
Réponds en français, en une ou deux phrases courtes faites pour être lues à voix haute. \
Si une date ou une heure manque, demande-la.";

/// Streamed reply text
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Conversational back-end
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Submit one user utterance
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn submit(&self, utterance: &str, context: &ConversationContext) -> Result<ReplyStream>;
}

/// Read a reply stream to completion
///
/// # Errors
///
/// Returns the first chunk error
pub async fn collect_reply(mut stream: ReplyStream) -> Result<String> {
    let mut reply = String::new();
    while let Some(chunk) = stream.next().await {
        reply.push_str(&chunk?);
    }
    Ok(reply.trim().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Recent conversation turns, oldest first
#[derive(Debug, Clone)]
pub struct ConversationContext {
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl ConversationContext {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a completed exchange
    pub fn record(&mut self, utterance: &str, reply: &str) {
        self.push(Role::User, utterance);
        self.push(Role::Assistant, reply);
    }

    fn push(&mut self, role: Role, content: &str) {
        if self.capacity == 0 {
            return;
        }
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            role,
            content: content.to_string(),
        });
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Turn>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental decoder for `data:` lines of a chat completion stream
#[derive(Default)]
struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            match serde_json::from_str::<ChatChunk>(data) {
                Ok(chunk) => events.extend(
                    chunk
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                        .map(SseEvent::Delta),
                ),
                Err(e) => tracing::debug!(error = %e, "skipping malformed stream chunk"),
            }
        }
        events
    }
}

/// `OpenAI`-compatible chat completion assistant
pub struct OpenAiAssistant {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenAiAssistant {
    /// Create a new assistant client
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: String, base_url: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for the assistant".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn messages(utterance: &str, context: &ConversationContext) -> Vec<Turn> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(Turn {
            role: Role::System,
            content: SYSTEM_PROMPT.to_string(),
        });
        messages.extend(context.turns().cloned());
        messages.push(Turn {
            role: Role::User,
            content: utterance.to_string(),
        });
        messages
    }
}

#[async_trait]
impl Assistant for OpenAiAssistant {
    async fn submit(&self, utterance: &str, context: &ConversationContext) -> Result<ReplyStream> {
        let request = ChatRequest {
            model: &self.model,
            messages: Self::messages(utterance, context),
            stream: true,
        };

        tracing::debug!(model = %self.model, turns = context.len(), "submitting to assistant");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Assistant(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Assistant(format!("API error {status}: {body}")));
        }

        let mut decoder = SseDecoder::default();
        let stream = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(Error::Assistant(format!("stream interrupted: {e}")))],
            })
            .flat_map(futures::stream::iter)
            .take_while(|item| futures::future::ready(!matches!(item, Ok(SseEvent::Done))))
            .filter_map(|item| {
                futures::future::ready(match item {
                    Ok(SseEvent::Delta(text)) => Some(Ok(text)),
                    Ok(SseEvent::Done) => None,
                    Err(e) => Some(Err(e)),
                })
            });

        Ok(Box::pin(stream))
    }
}
