//! Voice processing module
//!
//! Wake word detection, speech capture, speech output and the controller
//! that sequences them. Platform access sits behind traits so the controller
//! runs the same against cpal/HTTP providers and test doubles.

pub mod audio_session;
pub mod capture_session;
pub mod controller;
pub mod keyword;
pub mod microphone;
mod platform;
mod playback;
pub mod recognizer;
pub mod state;
pub mod stt;
pub mod tts;
pub mod wake_word;

pub use audio_session::{
    AudioContextHandle, AudioContextState, AudioPlatform, AudioSessionManager, DiagnosticSnapshot,
    PermissionState, Platform, VisibilityAction,
};
pub use capture_session::{
    CaptureMode, CaptureOutput, CaptureTranscript, RecognitionErrorKind, RecognitionSegment,
    RecognizerEvent, RecognizerMessage, SpeechCaptureSession, SpeechRecognizer,
};
pub use controller::{Collaborators, ControllerOptions, VoiceController, VoiceHandle};
pub use keyword::{
    DEFAULT_BANDS, EnergyKeywordEngine, EnergyKeywordEngineFactory, FRAME_LENGTH, KeywordEngine,
    KeywordEngineFactory, KeywordModel, SpectralEnvelope,
};
pub use microphone::{
    CpalMicrophone, FrameSource, FrameSubscription, MicOwner, MicrophoneArbiter, SAMPLE_RATE,
    frame_energy, samples_to_wav,
};
pub use platform::CpalPlatform;
pub use playback::AudioPlayback;
pub use recognizer::CloudRecognizer;
pub use state::{Availability, InteractionState, VoiceEvent};
pub use stt::{CloudTranscriber, Transcriber};
pub use tts::{CloudSpeaker, SilentSpeaker, Speaker, TextToSpeech};
pub use wake_word::{DetectorEvent, ModelSource, WAKE_PHRASE, WakeWordDetector, WakeWordStatus};
