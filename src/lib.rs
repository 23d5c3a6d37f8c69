//! Benji - hands-free voice front-end for a calendar assistant
//!
//! This library provides:
//! - Wake word detection ("Hello Benji") on the microphone stream
//! - Speech capture with debounced commits
//! - Speech output and the assistant round trip
//! - A background bridge relaying wake events and notifications between
//!   front-ends
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  VoiceController                     │
//! │  WakeWordDetector │ SpeechCaptureSession │ Speaker   │
//! │  AudioSessionManager │ MicrophoneArbiter             │
//! └──────────┬───────────────────────────┬───────────────┘
//!            │ committed transcript      │ wake / fallback
//! ┌──────────▼──────────┐     ┌──────────▼───────────────┐
//! │      Assistant      │     │  Bridge worker (+ /ws)   │
//! └─────────────────────┘     └──────────────────────────┘
//! ```

pub mod assistant;
pub mod bridge;
pub mod config;
pub mod daemon;
pub mod error;
pub mod voice;

pub use assistant::{Assistant, ConversationContext, OpenAiAssistant};
pub use bridge::{BridgeClient, BridgeHandle, BridgeOptions, BridgeServer};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use voice::{InteractionState, VoiceController, VoiceEvent, VoiceHandle};
