//! TOML configuration file loading
//!
//! Supports `~/.config/benji/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct BenjiConfigFile {
    /// Wake word engine configuration
    #[serde(default)]
    pub wake_word: WakeWordFileConfig,

    /// Voice capture and speech output configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Assistant (LLM) configuration
    #[serde(default)]
    pub assistant: AssistantFileConfig,

    /// Background bridge configuration
    #[serde(default)]
    pub bridge: BridgeFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Wake word section
#[derive(Debug, Default, Deserialize)]
pub struct WakeWordFileConfig {
    /// Access credential for the keyword engine
    pub access_key: Option<String>,

    /// Keyword model location (file path or http(s) URL)
    pub model_path: Option<String>,

    /// Detection sensitivity between 0.0 and 1.0
    pub sensitivity: Option<f32>,

    /// Start listening as soon as the pipeline is enabled
    pub auto_start: Option<bool>,
}

/// Voice section
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Recognition language (e.g. "fr")
    pub language: Option<String>,

    /// "single_shot" or "continuous"
    pub conversation_mode: Option<String>,

    /// Phrase spoken right after the wake word
    pub confirmation_phrase: Option<String>,

    /// Read assistant replies aloud
    pub speak_replies: Option<bool>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
}

/// Assistant section
#[derive(Debug, Default, Deserialize)]
pub struct AssistantFileConfig {
    /// Chat model identifier
    pub model: Option<String>,

    /// OpenAI-compatible base URL
    pub base_url: Option<String>,

    /// Number of previous turns sent as context
    pub context_turns: Option<usize>,
}

/// Bridge section
#[derive(Debug, Default, Deserialize)]
pub struct BridgeFileConfig {
    /// Port for the bridge WebSocket endpoint
    pub port: Option<u16>,

    /// Directory holding the asset caches
    pub cache_dir: Option<String>,

    /// Base URL critical assets are fetched from
    pub asset_base_url: Option<String>,

    /// Whether system notifications are allowed
    pub notifications: Option<bool>,
}

/// API keys section
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `BenjiConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> BenjiConfigFile {
    config_file_path().map_or_else(BenjiConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> BenjiConfigFile {
    if !path.is_file() {
        return BenjiConfigFile::default();
    }

    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| toml::from_str::<BenjiConfigFile>(&text).map_err(|e| e.to_string()));

    match parsed {
        Ok(config) => {
            tracing::info!(path = %path.display(), "config file applied");
            config
        }
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring unusable config file");
            BenjiConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/benji/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("benji").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let parsed: BenjiConfigFile = toml::from_str(
            r#"
            [wake_word]
            sensitivity = 0.7

            [voice]
            conversation_mode = "continuous"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.wake_word.sensitivity, Some(0.7));
        assert_eq!(parsed.voice.conversation_mode.as_deref(), Some("continuous"));
        assert!(parsed.bridge.port.is_none());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml"));
        assert!(config.wake_word.access_key.is_none());
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[voice\nbroken").unwrap();
        let config = load_from(&path);
        assert!(config.voice.language.is_none());
    }
}
