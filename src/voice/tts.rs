//! Text-to-speech (TTS) output

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::playback::AudioPlayback;
use crate::{Error, Result};

/// Reads text aloud; resolves when playback has finished
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Speak `text`
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    async fn speak(&self, text: &str) -> Result<()>;
}

/// `OpenAI` speech synthesis client
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    voice: String,
    speed: f32,
    model: String,
}

impl TextToSpeech {
    /// Create a synthesis client
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(
        api_key: SecretString,
        base_url: String,
        model: String,
        voice: String,
        speed: f32,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            voice,
            speed: speed.clamp(0.25, 4.0),
            model,
        })
    }

    /// Synthesize text to MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }
}

/// Synthesizes with [`TextToSpeech`] and plays through the default output
pub struct CloudSpeaker {
    tts: TextToSpeech,
    playback: AudioPlayback,
}

impl CloudSpeaker {
    #[must_use]
    pub const fn new(tts: TextToSpeech, playback: AudioPlayback) -> Self {
        Self { tts, playback }
    }
}

#[async_trait]
impl Speaker for CloudSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let audio = self.tts.synthesize(text).await?;
        self.playback.play_mp3(audio).await
    }
}

/// Speaker that only logs; used when no TTS key is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSpeaker;

#[async_trait]
impl Speaker for SilentSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        tracing::info!(text, "speech output disabled");
        Ok(())
    }
}
