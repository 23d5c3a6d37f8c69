//! Error types for the Benji voice pipeline

use thiserror::Error;

/// Result type alias for Benji operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access declined or blocked by the platform
    #[error("permission error: {0}")]
    Permission(String),

    /// Required platform capability is missing
    #[error("environment error: {0}")]
    Environment(String),

    /// Keyword model could not be fetched or is invalid
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Keyword engine rejected the access credential
    #[error("credential error: {0}")]
    Credential(String),

    /// Component used before initialization completed
    #[error("not ready: {0}")]
    NotReady(String),

    /// Speech recognition failure
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Assistant collaborator error
    #[error("assistant error: {0}")]
    Assistant(String),

    /// Background bridge error
    #[error("bridge error: {0}")]
    Bridge(String),

    /// Network failure that has already been rendered to text
    #[error("network error: {0}")]
    Network(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the error disables the whole voice pipeline for the session
    ///
    /// The manual push-to-talk path stays available even then.
    #[must_use]
    pub const fn is_fatal_for_pipeline(&self) -> bool {
        matches!(self, Self::Environment(_))
    }

    /// Whether the error only disables wake-word detection
    #[must_use]
    pub const fn is_wake_word_only(&self) -> bool {
        matches!(self, Self::ModelLoad(_) | Self::Credential(_))
    }

    /// Whether the user can recover by retrying (e.g. granting permission)
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Permission(_) | Self::Network(_) | Self::Http(_))
    }

    /// Copy of the error suitable for fanning out to several waiters
    ///
    /// Variants wrapping foreign error types are rendered to text.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Config(m) => Self::Config(m.clone()),
            Self::Permission(m) => Self::Permission(m.clone()),
            Self::Environment(m) => Self::Environment(m.clone()),
            Self::ModelLoad(m) => Self::ModelLoad(m.clone()),
            Self::Credential(m) => Self::Credential(m.clone()),
            Self::NotReady(m) => Self::NotReady(m.clone()),
            Self::Recognition(m) => Self::Recognition(m.clone()),
            Self::Audio(m) => Self::Audio(m.clone()),
            Self::Stt(m) => Self::Stt(m.clone()),
            Self::Tts(m) => Self::Tts(m.clone()),
            Self::Assistant(m) => Self::Assistant(m.clone()),
            Self::Bridge(m) => Self::Bridge(m.clone()),
            Self::Network(m) => Self::Network(m.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Http(e) => Self::Network(e.to_string()),
            Self::Serialization(e) => Self::Bridge(e.to_string()),
            Self::Toml(e) => Self::Config(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classification() {
        assert!(Error::Environment("insecure".into()).is_fatal_for_pipeline());
        assert!(!Error::Permission("denied".into()).is_fatal_for_pipeline());
        assert!(Error::ModelLoad("404".into()).is_wake_word_only());
        assert!(Error::Credential("bad key".into()).is_wake_word_only());
        assert!(Error::Permission("denied".into()).is_retryable());
    }

    #[test]
    fn duplicate_keeps_variant() {
        let original = Error::Credential("rejected".into());
        assert!(matches!(original.duplicate(), Error::Credential(m) if m == "rejected"));

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(matches!(io.duplicate(), Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound));
    }
}
