//! Speech-to-text (STT) over HTTP
//!
//! Whisper (or any `OpenAI`-compatible transcription endpoint) and Deepgram.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1";

/// Converts a WAV clip to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio
    ///
    /// # Errors
    ///
    /// Returns error if the provider is unreachable or rejects the request
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

#[derive(serde::Deserialize)]
struct WhisperBody {
    text: String,
}

#[derive(serde::Deserialize)]
struct DeepgramBody {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

impl DeepgramBody {
    fn into_transcript(self) -> String {
        self.results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    Whisper,
    Deepgram,
}

impl Backend {
    const fn label(self) -> &'static str {
        match self {
            Self::Whisper => "whisper",
            Self::Deepgram => "deepgram",
        }
    }
}

/// Cloud transcription client
pub struct CloudTranscriber {
    http: reqwest::Client,
    key: SecretString,
    model: String,
    language: String,
    endpoint: String,
    backend: Backend,
}

impl CloudTranscriber {
    fn build(
        backend: Backend,
        key: SecretString,
        model: String,
        language: String,
        base_url: &str,
    ) -> Result<Self> {
        if key.expose_secret().trim().is_empty() {
            return Err(Error::Config(format!(
                "{} transcription needs an API key",
                backend.label()
            )));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            key,
            model,
            language,
            endpoint: base_url.trim_end_matches('/').to_string(),
            backend,
        })
    }

    /// Transcribe with `OpenAI` Whisper at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn whisper(
        api_key: SecretString,
        model: String,
        language: String,
        base_url: String,
    ) -> Result<Self> {
        Self::build(Backend::Whisper, api_key, model, language, &base_url)
    }

    /// Transcribe with Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn deepgram(api_key: SecretString, model: String, language: String) -> Result<Self> {
        Self::build(Backend::Deepgram, api_key, model, language, DEEPGRAM_URL)
    }

    fn request(&self, wav: &[u8]) -> Result<reqwest::RequestBuilder> {
        let secret = self.key.expose_secret();
        match self.backend {
            Backend::Whisper => {
                let clip = reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?;
                let form = reqwest::multipart::Form::new()
                    .part("file", clip)
                    .text("model", self.model.clone())
                    .text("language", self.language.clone());
                Ok(self
                    .http
                    .post(format!("{}/audio/transcriptions", self.endpoint))
                    .bearer_auth(secret)
                    .multipart(form))
            }
            Backend::Deepgram => Ok(self
                .http
                .post(format!("{}/listen", self.endpoint))
                .query(&[
                    ("model", self.model.as_str()),
                    ("language", self.language.as_str()),
                    ("punctuate", "true"),
                ])
                .header(reqwest::header::AUTHORIZATION, format!("Token {secret}"))
                .header(reqwest::header::CONTENT_TYPE, "audio/wav")
                .body(wav.to_vec())),
        }
    }
}

#[async_trait]
impl Transcriber for CloudTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        let backend = self.backend.label();
        tracing::debug!(backend, bytes = wav.len(), "transcribing utterance");

        let response = self.request(wav)?.send().await.map_err(|e| {
            tracing::warn!(backend, error = %e, "transcription request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!(backend, %status, detail, "transcription rejected");
            return Err(Error::Stt(format!("{backend} returned {status}: {detail}")));
        }

        let text = match self.backend {
            Backend::Whisper => response.json::<WhisperBody>().await?.text,
            Backend::Deepgram => response.json::<DeepgramBody>().await?.into_transcript(),
        };
        tracing::info!(backend, transcript = %text, "utterance transcribed");
        Ok(text)
    }
}
