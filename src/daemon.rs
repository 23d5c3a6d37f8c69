//! Daemon - the main voice service
//!
//! Wires the cpal/HTTP implementations into the controller, runs the bridge
//! worker and its HTTP server, and waits for Ctrl-C.

use std::sync::Arc;

use secrecy::SecretString;

use crate::assistant::{Assistant, OpenAiAssistant};
use crate::bridge::{self, BridgeHandle, BridgeOptions, BridgeServer, LogNotifier};
use crate::voice::{
    AudioPlayback, CloudRecognizer, CloudSpeaker, CloudTranscriber, Collaborators,
    ControllerOptions, CpalMicrophone, CpalPlatform, EnergyKeywordEngineFactory, FrameSource,
    SilentSpeaker, Speaker, TextToSpeech, Transcriber, VoiceController, VoiceEvent, VoiceHandle,
    WAKE_PHRASE,
};
use crate::{Config, Error, Result};

/// Deepgram model used when Deepgram is the STT provider
const DEEPGRAM_MODEL: &str = "nova-2";

/// The Benji daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    fn openai_key(&self) -> Result<SecretString> {
        self.config
            .api_keys
            .openai
            .clone()
            .ok_or_else(|| Error::Config("OPENAI_API_KEY is required".to_string()))
    }

    fn transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        let voice = &self.config.voice;
        if let Some(key) = &self.config.api_keys.deepgram {
            tracing::info!("using Deepgram for STT");
            return Ok(Arc::new(CloudTranscriber::deepgram(
                key.clone(),
                DEEPGRAM_MODEL.to_string(),
                voice.language.clone(),
            )?));
        }

        tracing::info!(model = %voice.stt_model, "using Whisper for STT");
        Ok(Arc::new(CloudTranscriber::whisper(
            self.openai_key()?,
            voice.stt_model.clone(),
            voice.language.clone(),
            self.config.assistant.base_url.clone(),
        )?))
    }

    fn speaker(&self) -> Result<Arc<dyn Speaker>> {
        let voice = &self.config.voice;
        let playback = match AudioPlayback::new() {
            Ok(playback) => playback,
            Err(e) => {
                tracing::warn!(error = %e, "no audio output, speech disabled");
                return Ok(Arc::new(SilentSpeaker));
            }
        };

        let tts = TextToSpeech::new(
            self.openai_key()?,
            self.config.assistant.base_url.clone(),
            voice.tts_model.clone(),
            voice.tts_voice.clone(),
            voice.tts_speed,
        )?;
        Ok(Arc::new(CloudSpeaker::new(tts, playback)))
    }

    fn spawn_bridge(&self) -> Result<BridgeHandle> {
        let options = BridgeOptions::from_config(&self.config)?;
        Ok(bridge::spawn(options, Arc::new(LogNotifier)))
    }

    /// Build the controller with the real platform implementations
    ///
    /// # Errors
    ///
    /// Returns error if a required API key is missing
    pub fn voice(&self, bridge: Option<&BridgeHandle>) -> Result<VoiceHandle> {
        let microphone: Arc<dyn FrameSource> = Arc::new(CpalMicrophone);
        let assistant: Arc<dyn Assistant> = Arc::new(OpenAiAssistant::new(
            self.openai_key()?,
            self.config.assistant.model.clone(),
            self.config.assistant.base_url.clone(),
        )?);

        let collaborators = Collaborators {
            keyword_factory: Arc::new(EnergyKeywordEngineFactory),
            microphone: Arc::clone(&microphone),
            recognizer: Box::new(CloudRecognizer::new(
                Arc::clone(&microphone),
                self.transcriber()?,
            )),
            speaker: self.speaker()?,
            assistant,
            platform: Arc::new(CpalPlatform::new(microphone)),
            http: reqwest::Client::new(),
            bridge: bridge.map(BridgeHandle::connect),
        };

        Ok(VoiceController::spawn(
            ControllerOptions::from_config(&self.config),
            collaborators,
        ))
    }

    /// Run the bridge worker and its server only
    ///
    /// # Errors
    ///
    /// Returns error if the bridge cannot start
    pub async fn run_bridge(self) -> Result<()> {
        let handle = self.spawn_bridge()?;
        let server = BridgeServer::new(handle, self.config.bridge.port).spawn();

        tokio::select! {
            result = server => {
                result.map_err(|e| Error::Bridge(format!("bridge server task failed: {e}")))??;
            }
            _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        }
        Ok(())
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the daemon cannot be set up
    pub async fn run(self) -> Result<()> {
        let bridge = self.spawn_bridge()?;
        let server = BridgeServer::new(bridge.clone(), self.config.bridge.port).spawn();
        let voice = self.voice(Some(&bridge))?;

        let mut events = voice.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => log_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "voice event log lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if self.config.wake_word.auto_start {
            match voice.enable().await {
                Ok(()) => tracing::info!("benji ready - say \"{WAKE_PHRASE}\""),
                Err(e) => tracing::warn!(error = %e, "wake word unavailable, manual input only"),
            }
        } else {
            tracing::info!("benji ready (wake word not started)");
        }

        tokio::select! {
            result = server => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "bridge server stopped"),
                    Err(e) => tracing::error!(error = %e, "bridge server task failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        }

        voice.disable().await?;
        Ok(())
    }
}

fn log_event(event: &VoiceEvent) {
    match event {
        VoiceEvent::Committed { text } => tracing::info!(text = %text, "you said"),
        VoiceEvent::Reply { text } => tracing::info!(text = %text, "benji replied"),
        VoiceEvent::Error { message } => tracing::warn!(message = %message, "voice error"),
        other => tracing::debug!(event = ?other, "voice event"),
    }
}
