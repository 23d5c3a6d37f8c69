//! Speech capture session
//!
//! Wraps a [`SpeechRecognizer`] and turns its raw results into interim text for
//! display and debounced commits for the assistant. The session is a plain state
//! machine: recognizer messages go through [`SpeechCaptureSession::handle`] and
//! timers through [`SpeechCaptureSession::poll`], both with an explicit `now`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{Error, Result};

/// Quiet period after a final result before the transcript is committed
pub const COMMIT_DEBOUNCE: Duration = Duration::from_millis(700);

/// Delay before re-arming a continuous session after the recognizer ended
pub const RESTART_AFTER_END: Duration = Duration::from_millis(100);

/// Delay before re-arming a continuous session after a transient error
pub const RESTART_AFTER_ERROR: Duration = Duration::from_millis(500);

/// How a capture session behaves after an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// One utterance, then the session closes
    SingleShot,
    /// Keeps re-arming itself until stopped
    Continuous,
}

impl FromStr for CaptureMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single_shot" | "single-shot" | "single" => Ok(Self::SingleShot),
            "continuous" => Ok(Self::Continuous),
            other => Err(Error::Config(format!("unknown conversation mode {other:?}"))),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleShot => f.write_str("single_shot"),
            Self::Continuous => f.write_str("continuous"),
        }
    }
}

/// Recognizer failure kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    PermissionDenied,
    AudioCaptureFailed,
    NetworkRequired,
    Aborted,
    Other(String),
}

impl RecognitionErrorKind {
    /// Transient errors are recovered silently
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NoSpeech | Self::Aborted)
    }

    /// Map a provider error code
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "no-speech" => Self::NoSpeech,
            "not-allowed" | "service-not-allowed" => Self::PermissionDenied,
            "audio-capture" => Self::AudioCaptureFailed,
            "network" => Self::NetworkRequired,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }

    /// Convert to the crate error surfaced to the user
    #[must_use]
    pub fn to_error(&self) -> Error {
        match self {
            Self::PermissionDenied => Error::Permission("microphone access denied".to_string()),
            Self::AudioCaptureFailed => Error::Recognition("audio capture failed".to_string()),
            Self::NetworkRequired => {
                Error::Recognition("speech recognition needs a network connection".to_string())
            }
            Self::NoSpeech => Error::Recognition("no speech detected".to_string()),
            Self::Aborted => Error::Recognition("recognition aborted".to_string()),
            Self::Other(code) => Error::Recognition(code.clone()),
        }
    }
}

/// One recognized piece of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionSegment {
    pub text: String,
    pub is_final: bool,
}

impl RecognitionSegment {
    #[must_use]
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    #[must_use]
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Raw recognizer event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// New segments; a final segment replaces the pending interim one
    Result { segments: Vec<RecognitionSegment> },
    Error(RecognitionErrorKind),
    /// The recognizer stopped on its own
    End,
}

/// Recognizer event tagged with the run it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerMessage {
    pub generation: u64,
    pub event: RecognizerEvent,
}

/// Speech-to-text provider
pub trait SpeechRecognizer: Send {
    /// Begin a recognizer run; every event must carry `generation`
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer cannot start (e.g. no microphone)
    fn start(
        &mut self,
        generation: u64,
        continuous: bool,
        events: mpsc::UnboundedSender<RecognizerMessage>,
    ) -> Result<()>;

    /// Stop the current run; idempotent
    fn stop(&mut self);

    /// Whether recognition is supported at all
    fn is_available(&self) -> bool;
}

/// Text accumulated during a capture session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureTranscript {
    segments: Vec<String>,
    interim: Option<String>,
    updated_at: Option<Instant>,
}

impl CaptureTranscript {
    fn apply(&mut self, segments: Vec<RecognitionSegment>, now: Instant) {
        for segment in segments {
            let text = segment.text.trim().to_string();
            if segment.is_final {
                self.interim = None;
                if !text.is_empty() {
                    self.segments.push(text);
                }
            } else {
                self.interim = Some(text);
            }
        }
        self.updated_at = Some(now);
    }

    /// Concatenated text, interim part last
    #[must_use]
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(String::as_str)
            .chain(self.interim.as_deref().filter(|t| !t.is_empty()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True when the latest update was final
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.interim.is_none() && !self.segments.is_empty()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.interim.as_deref().is_none_or(str::is_empty)
    }

    #[must_use]
    pub const fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What the session wants its owner to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutput {
    /// Display-only text
    Interim(String),
    /// Text to forward to the assistant
    Commit(String),
    /// Hard error; auto-restart is now off
    Error(RecognitionErrorKind),
    /// Continuous session re-armed itself
    Restarted,
    /// Session closed on its own
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Paused,
}

/// One capture session over a speech recognizer
pub struct SpeechCaptureSession {
    recognizer: Box<dyn SpeechRecognizer>,
    events: mpsc::UnboundedSender<RecognizerMessage>,
    mode: CaptureMode,
    phase: Phase,
    generation: u64,
    recognizer_live: bool,
    auto_restart: bool,
    committing: bool,
    transcript: CaptureTranscript,
    commit_at: Option<Instant>,
    restart_at: Option<Instant>,
}

impl SpeechCaptureSession {
    /// Create an idle session; recognizer events go to `events`
    #[must_use]
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        events: mpsc::UnboundedSender<RecognizerMessage>,
    ) -> Self {
        Self {
            recognizer,
            events,
            mode: CaptureMode::SingleShot,
            phase: Phase::Idle,
            generation: 0,
            recognizer_live: false,
            auto_restart: false,
            committing: false,
            transcript: CaptureTranscript::default(),
            commit_at: None,
            restart_at: None,
        }
    }

    /// Open a capture with a fresh transcript
    ///
    /// Calling it while already running in the same mode is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer fails to start
    pub fn start(&mut self, mode: CaptureMode) -> Result<()> {
        if self.phase == Phase::Running && self.mode == mode {
            return Ok(());
        }
        self.stop();

        self.mode = mode;
        self.auto_restart = mode == CaptureMode::Continuous;
        self.launch()?;
        tracing::debug!(%mode, generation = self.generation, "capture started");
        Ok(())
    }

    fn launch(&mut self) -> Result<()> {
        self.generation += 1;
        let continuous = self.mode == CaptureMode::Continuous;
        match self
            .recognizer
            .start(self.generation, continuous, self.events.clone())
        {
            Ok(()) => {
                self.phase = Phase::Running;
                self.recognizer_live = true;
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Idle;
                self.recognizer_live = false;
                self.auto_restart = false;
                Err(e)
            }
        }
    }

    fn halt_recognizer(&mut self) {
        // Bumping the generation drops anything still in flight
        self.generation += 1;
        if self.recognizer_live {
            self.recognizer.stop();
            self.recognizer_live = false;
        }
    }

    /// Cancel pending timers, stop the recognizer and clear the transcript
    ///
    /// Safe to call in any state.
    pub fn stop(&mut self) {
        if self.phase != Phase::Idle {
            tracing::debug!(generation = self.generation, "capture stopped");
        }
        self.halt_recognizer();
        self.phase = Phase::Idle;
        self.auto_restart = false;
        self.committing = false;
        self.transcript.clear();
        self.commit_at = None;
        self.restart_at = None;
    }

    /// Stop listening without ending the session (the system is speaking)
    pub fn pause(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        self.halt_recognizer();
        self.phase = Phase::Paused;
        self.transcript.clear();
        self.commit_at = None;
        self.restart_at = None;
        tracing::debug!("capture paused");
    }

    /// Resume a paused session
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer fails to restart
    pub fn resume(&mut self) -> Result<()> {
        if self.phase != Phase::Paused {
            return Ok(());
        }
        self.launch()?;
        tracing::debug!(generation = self.generation, "capture resumed");
        Ok(())
    }

    /// Apply a recognizer message; stale generations are ignored
    pub fn handle(&mut self, message: RecognizerMessage, now: Instant) -> Vec<CaptureOutput> {
        if message.generation != self.generation || self.phase != Phase::Running {
            tracing::trace!(
                generation = message.generation,
                current = self.generation,
                "dropping stale recognizer event"
            );
            return Vec::new();
        }

        match message.event {
            RecognizerEvent::Result { segments } => {
                let last_final = segments.last().is_some_and(|s| s.is_final);
                self.transcript.apply(segments, now);

                // A pending window is reset by any update, final or not
                if last_final || self.commit_at.is_some() {
                    self.commit_at = Some(now + COMMIT_DEBOUNCE);
                }
                vec![CaptureOutput::Interim(self.transcript.text())]
            }
            RecognizerEvent::Error(kind) => self.on_error(kind, now),
            RecognizerEvent::End => self.on_end(now),
        }
    }

    fn on_error(&mut self, kind: RecognitionErrorKind, now: Instant) -> Vec<CaptureOutput> {
        self.recognizer_live = false;
        self.recognizer.stop();
        self.transcript.clear();
        self.commit_at = None;

        if kind.is_transient() {
            tracing::debug!(?kind, "transient recognition error");
            if self.mode == CaptureMode::Continuous && self.auto_restart {
                self.restart_at = Some(now + RESTART_AFTER_ERROR);
                return Vec::new();
            }
            self.stop();
            return vec![CaptureOutput::Ended];
        }

        tracing::warn!(?kind, "recognition error");
        self.stop();
        vec![CaptureOutput::Error(kind)]
    }

    fn on_end(&mut self, now: Instant) -> Vec<CaptureOutput> {
        self.recognizer_live = false;
        if self.restart_at.is_some() {
            return Vec::new();
        }

        if self.mode == CaptureMode::Continuous && self.auto_restart {
            self.restart_at = Some(now + RESTART_AFTER_END);
            return Vec::new();
        }

        // Single-shot: a final result may still be inside its debounce window
        if self.commit_at.is_some() {
            return Vec::new();
        }
        self.stop();
        vec![CaptureOutput::Ended]
    }

    /// Fire due timers
    pub fn poll(&mut self, now: Instant) -> Vec<CaptureOutput> {
        let mut out = Vec::new();

        if self.commit_at.is_some_and(|at| at <= now) {
            if self.committing {
                // Previous commit still being handled
                self.commit_at = Some(now + COMMIT_DEBOUNCE);
            } else {
                self.commit_at = None;
                let text = self.transcript.text();
                self.transcript.clear();
                if !text.is_empty() {
                    self.committing = true;
                    tracing::debug!(text = %text, "transcript committed");
                    out.push(CaptureOutput::Commit(text));
                }
                if !self.recognizer_live && self.mode == CaptureMode::SingleShot {
                    let committing = self.committing;
                    self.stop();
                    self.committing = committing;
                    out.push(CaptureOutput::Ended);
                }
            }
        }

        if self.restart_at.is_some_and(|at| at <= now) {
            self.restart_at = None;
            if self.phase == Phase::Running && self.auto_restart {
                match self.launch() {
                    Ok(()) => {
                        tracing::debug!(generation = self.generation, "capture restarted");
                        out.push(CaptureOutput::Restarted);
                    }
                    Err(e) => {
                        let kind = RecognitionErrorKind::Other(e.to_string());
                        self.stop();
                        out.push(CaptureOutput::Error(kind));
                    }
                }
            }
        }

        out
    }

    /// Earliest pending timer
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.commit_at, self.restart_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The consumer finished handling the last commit
    pub const fn commit_done(&mut self) {
        self.committing = false;
    }

    /// Whether the session is open and not paused
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase == Phase::Running
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.phase == Phase::Paused
    }

    /// Whether a commit is awaiting [`Self::commit_done`]
    #[must_use]
    pub const fn is_committing(&self) -> bool {
        self.committing
    }

    #[must_use]
    pub const fn mode(&self) -> CaptureMode {
        self.mode
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn transcript(&self) -> &CaptureTranscript {
        &self.transcript
    }

    #[must_use]
    pub fn recognizer_available(&self) -> bool {
        self.recognizer.is_available()
    }
}
