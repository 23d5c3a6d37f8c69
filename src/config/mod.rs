//! Configuration management for Benji
//!
//! Precedence is env > toml > default.

pub mod file;

use std::path::PathBuf;

use secrecy::SecretString;

use crate::voice::CaptureMode;
use crate::{Error, Result};

/// Default confirmation phrase spoken after the wake word
pub const DEFAULT_CONFIRMATION: &str = "Oui ?";

/// Default bridge port
pub const DEFAULT_BRIDGE_PORT: u16 = 18_790;

/// Benji configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Wake word engine configuration
    pub wake_word: WakeWordConfig,

    /// Voice capture and speech output configuration
    pub voice: VoiceConfig,

    /// Assistant configuration
    pub assistant: AssistantConfig,

    /// Background bridge configuration
    pub bridge: BridgeConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Path to data directory (models, caches)
    pub data_dir: PathBuf,
}

/// Wake word engine configuration
#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    /// Access credential handed to the keyword engine
    pub access_key: Option<SecretString>,

    /// Keyword model location (file path or URL)
    pub model_path: String,

    /// Detection sensitivity, clamped to 0.0..=1.0
    pub sensitivity: f32,

    /// Start listening right after initialization
    pub auto_start: bool,
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Recognition language code
    pub language: String,

    /// Conversation mode after a wake word
    pub conversation_mode: CaptureMode,

    /// Phrase spoken after the wake word
    pub confirmation_phrase: String,

    /// Read assistant replies aloud
    pub speak_replies: bool,

    /// STT model (e.g. "whisper-1")
    pub stt_model: String,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,
}

/// Assistant configuration
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Chat model identifier
    pub model: String,

    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Number of previous turns kept as context
    pub context_turns: usize,
}

/// Background bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket endpoint port
    pub port: u16,

    /// Directory holding named asset caches
    pub cache_dir: PathBuf,

    /// Base URL critical assets are fetched from (local files when absent)
    pub asset_base_url: Option<String>,

    /// Whether system notifications are permitted
    pub notifications: bool,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, TTS, chat)
    pub openai: Option<SecretString>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<SecretString>,
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but malformed
    pub fn from_sources(
        fc: file::BenjiConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let data_dir = env("BENJI_DATA_DIR").map_or_else(
            || {
                directories::BaseDirs::new()
                    .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("benji"))
            },
            PathBuf::from,
        );

        let sensitivity = match env("BENJI_SENSITIVITY") {
            Some(raw) => raw
                .parse::<f32>()
                .map_err(|e| Error::Config(format!("invalid BENJI_SENSITIVITY {raw:?}: {e}")))?,
            None => fc.wake_word.sensitivity.unwrap_or(0.5),
        };

        let wake_word = WakeWordConfig {
            access_key: env("BENJI_ACCESS_KEY")
                .or(fc.wake_word.access_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            model_path: env("BENJI_MODEL_PATH")
                .or(fc.wake_word.model_path)
                .unwrap_or_else(|| {
                    data_dir
                        .join("models")
                        .join("hello_benji.bnjw")
                        .display()
                        .to_string()
                }),
            sensitivity: sensitivity.clamp(0.0, 1.0),
            auto_start: fc.wake_word.auto_start.unwrap_or(true),
        };

        let mode_raw = env("BENJI_CONVERSATION_MODE").or(fc.voice.conversation_mode);
        let conversation_mode = match mode_raw {
            Some(raw) => raw.parse()?,
            None => CaptureMode::SingleShot,
        };

        let voice = VoiceConfig {
            language: env("BENJI_LANGUAGE")
                .or(fc.voice.language)
                .unwrap_or_else(|| "fr".to_string()),
            conversation_mode,
            confirmation_phrase: fc
                .voice
                .confirmation_phrase
                .unwrap_or_else(|| DEFAULT_CONFIRMATION.to_string()),
            speak_replies: fc.voice.speak_replies.unwrap_or(true),
            stt_model: env("BENJI_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_model: env("BENJI_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| "tts-1".to_string()),
            tts_voice: fc.voice.tts_voice.unwrap_or_else(|| "alloy".to_string()),
            tts_speed: fc.voice.tts_speed.unwrap_or(1.0).clamp(0.25, 4.0),
        };

        let assistant = AssistantConfig {
            model: env("BENJI_ASSISTANT_MODEL")
                .or(fc.assistant.model)
                .unwrap_or_else(|| "gpt-4-turbo".to_string()),
            base_url: env("OPENAI_BASE_URL")
                .or(fc.assistant.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            context_turns: fc.assistant.context_turns.unwrap_or(10),
        };

        let port = match env("BENJI_BRIDGE_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid BENJI_BRIDGE_PORT {raw:?}: {e}")))?,
            None => fc.bridge.port.unwrap_or(DEFAULT_BRIDGE_PORT),
        };

        let bridge = BridgeConfig {
            port,
            cache_dir: fc
                .bridge
                .cache_dir
                .map_or_else(|| data_dir.join("cache"), PathBuf::from),
            asset_base_url: env("BENJI_ASSET_BASE_URL").or(fc.bridge.asset_base_url),
            notifications: fc.bridge.notifications.unwrap_or(true),
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .map(SecretString::from),
            deepgram: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .map(SecretString::from),
        };

        Ok(Self {
            wake_word,
            voice,
            assistant,
            bridge,
            api_keys,
            data_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(file::BenjiConfigFile::default(), env_from(&[])).unwrap();

        assert!(config.wake_word.access_key.is_none());
        assert!((config.wake_word.sensitivity - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.voice.conversation_mode, CaptureMode::SingleShot);
        assert_eq!(config.voice.confirmation_phrase, DEFAULT_CONFIRMATION);
        assert_eq!(config.bridge.port, DEFAULT_BRIDGE_PORT);
    }

    #[test]
    fn env_overrides_file() {
        let fc: file::BenjiConfigFile = toml::from_str(
            r#"
            [wake_word]
            access_key = "from-file"
            sensitivity = 0.2

            [voice]
            conversation_mode = "single_shot"
            "#,
        )
        .unwrap();

        let config = Config::from_sources(
            fc,
            env_from(&[
                ("BENJI_ACCESS_KEY", "from-env"),
                ("BENJI_CONVERSATION_MODE", "continuous"),
            ]),
        )
        .unwrap();

        assert_eq!(
            config.wake_word.access_key.unwrap().expose_secret(),
            "from-env"
        );
        assert!((config.wake_word.sensitivity - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.voice.conversation_mode, CaptureMode::Continuous);
    }

    #[test]
    fn sensitivity_is_clamped() {
        let config = Config::from_sources(
            file::BenjiConfigFile::default(),
            env_from(&[("BENJI_SENSITIVITY", "3.5")]),
        )
        .unwrap();
        assert!((config.wake_word.sensitivity - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn malformed_port_is_rejected() {
        let result = Config::from_sources(
            file::BenjiConfigFile::default(),
            env_from(&[("BENJI_BRIDGE_PORT", "not-a-port")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn empty_access_key_is_ignored() {
        let config = Config::from_sources(
            file::BenjiConfigFile::default(),
            env_from(&[("BENJI_ACCESS_KEY", "")]),
        )
        .unwrap();
        assert!(config.wake_word.access_key.is_none());
    }
}
