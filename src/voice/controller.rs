//! Voice interaction controller
//!
//! One actor task per front-end. It owns the wake word detector, the capture
//! session, the microphone arbiter and the [`InteractionState`], and drives
//! the hand-off wake → confirmation → capture → assistant → reply.
//!
//! Everything reaches the actor as a message: commands from [`VoiceHandle`],
//! detector and recognizer events, bridge messages and completions of the
//! async work it spawns. Completions carry an epoch or token and are dropped
//! when a newer request superseded them.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::audio_session::{
    AudioPlatform, AudioSessionManager, DiagnosticSnapshot, PermissionState, VisibilityAction,
};
use super::capture_session::{
    CaptureMode, CaptureOutput, RecognitionErrorKind, RecognizerMessage, SpeechCaptureSession,
    SpeechRecognizer,
};
use super::keyword::{KeywordEngine, KeywordEngineFactory};
use super::microphone::{FrameSource, MicOwner, MicrophoneArbiter, SAMPLE_RATE};
use super::state::{Availability, InteractionState, VoiceEvent, diff};
use super::tts::Speaker;
use super::wake_word::{DetectorEvent, ModelSource, WakeWordDetector};
use crate::assistant::{Assistant, ConversationContext, collect_reply};
use crate::bridge::{BridgeClient, BridgeSender, ClientMessage, WorkerMessage};
use crate::{Config, Error, Result};

/// How long `is_wake_detected` stays set
pub const WAKE_INDICATOR: Duration = Duration::from_secs(2);

/// Capture without speech for this long returns to wake listening
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Detections closer together than this count as one
pub const WAKE_REFRACTORY: Duration = Duration::from_secs(2);

/// Bridge heartbeat period
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

/// Controller behaviour settings
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub credential: Option<SecretString>,
    pub model: String,
    pub sensitivity: f32,
    pub mode: CaptureMode,
    pub confirmation_phrase: String,
    pub speak_replies: bool,
    pub context_turns: usize,
}

impl ControllerOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            credential: config.wake_word.access_key.clone(),
            model: config.wake_word.model_path.clone(),
            sensitivity: config.wake_word.sensitivity,
            mode: config.voice.conversation_mode,
            confirmation_phrase: config.voice.confirmation_phrase.clone(),
            speak_replies: config.voice.speak_replies,
            context_turns: config.assistant.context_turns,
        }
    }
}

/// Platform implementations the controller drives
pub struct Collaborators {
    pub keyword_factory: Arc<dyn KeywordEngineFactory>,
    pub microphone: Arc<dyn FrameSource>,
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub speaker: Arc<dyn Speaker>,
    pub assistant: Arc<dyn Assistant>,
    pub platform: Arc<dyn AudioPlatform>,
    pub http: reqwest::Client,
    pub bridge: Option<BridgeClient>,
}

enum Command {
    Enable(oneshot::Sender<Result<()>>),
    Disable(oneshot::Sender<()>),
    RequestPermission(oneshot::Sender<Result<PermissionState>>),
    SubmitManualTranscript {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StartManualCapture(oneshot::Sender<Result<()>>),
    StopCapture(oneshot::Sender<()>),
    SetSpeaking {
        speaking: bool,
        reply: oneshot::Sender<()>,
    },
    SetVisibility {
        visible: bool,
        reply: oneshot::Sender<()>,
    },
    Diagnostics(oneshot::Sender<DiagnosticSnapshot>),
    SimulateWake(oneshot::Sender<Result<()>>),
}

/// Completion of work the actor spawned
enum Internal {
    EnableFinished {
        epoch: u64,
        permission: Option<PermissionState>,
        result: Result<Box<dyn KeywordEngine>>,
    },
    PermissionResolved {
        result: Result<PermissionState>,
        reply: oneshot::Sender<Result<PermissionState>>,
    },
    SpeechFinished {
        token: u64,
        result: Result<()>,
    },
    ReplyFinished {
        token: u64,
        utterance: String,
        result: Result<String>,
    },
    VisibilityResolved {
        epoch: u64,
        action: VisibilityAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disabled,
    Enabling,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Idle,
    /// Confirmation phrase playing
    Confirming,
    Capturing { manual: bool },
    /// Capture closed, reply outstanding
    AwaitingReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speech {
    Confirmation,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeSource {
    Local,
    Remote,
}

/// Handle to a running controller
#[derive(Clone)]
pub struct VoiceHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<InteractionState>,
    events: broadcast::Sender<VoiceEvent>,
}

impl VoiceHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| controller_gone())?;
        rx.await.map_err(|_| controller_gone())
    }

    /// Initialize the pipeline and start wake word listening
    ///
    /// # Errors
    ///
    /// Returns the initialization error; manual capture remains usable
    pub async fn enable(&self) -> Result<()> {
        self.request(Command::Enable).await?
    }

    /// Stop everything and release the detector; idempotent
    ///
    /// # Errors
    ///
    /// Returns error only if the controller task is gone
    pub async fn disable(&self) -> Result<()> {
        self.request(Command::Disable).await
    }

    /// Ask for microphone access
    ///
    /// # Errors
    ///
    /// Returns error if the platform check fails
    pub async fn request_permission(&self) -> Result<PermissionState> {
        self.request(Command::RequestPermission).await?
    }

    /// Send typed text to the assistant as if it had been spoken
    ///
    /// # Errors
    ///
    /// Returns `Error::NotReady` while another turn is in flight
    pub async fn submit_manual_transcript(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.request(|reply| Command::SubmitManualTranscript { text, reply })
            .await?
    }

    /// Push-to-talk: open a single-shot capture without a wake word
    ///
    /// # Errors
    ///
    /// Returns error if a turn is in flight or the recognizer cannot start
    pub async fn start_manual_capture(&self) -> Result<()> {
        self.request(Command::StartManualCapture).await?
    }

    /// Close the current capture and go back to wake listening
    ///
    /// # Errors
    ///
    /// Returns error only if the controller task is gone
    pub async fn stop_capture(&self) -> Result<()> {
        self.request(Command::StopCapture).await
    }

    /// Report that something else is playing audio
    ///
    /// # Errors
    ///
    /// Returns error only if the controller task is gone
    pub async fn set_speaking(&self, speaking: bool) -> Result<()> {
        self.request(|reply| Command::SetSpeaking { speaking, reply })
            .await
    }

    /// Report front-end visibility
    ///
    /// # Errors
    ///
    /// Returns error only if the controller task is gone
    pub async fn set_visibility(&self, visible: bool) -> Result<()> {
        self.request(|reply| Command::SetVisibility { visible, reply })
            .await
    }

    /// Inspect the environment
    ///
    /// # Errors
    ///
    /// Returns error only if the controller task is gone
    pub async fn diagnostics(&self) -> Result<DiagnosticSnapshot> {
        self.request(Command::Diagnostics).await
    }

    /// Behave as if the wake word had been heard
    ///
    /// # Errors
    ///
    /// Returns `Error::NotReady` unless wake listening is enabled
    pub async fn simulate_wake(&self) -> Result<()> {
        self.request(Command::SimulateWake).await?
    }

    /// Current state snapshot
    #[must_use]
    pub fn state(&self) -> InteractionState {
        self.state.borrow().clone()
    }

    /// Watch full state snapshots
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<InteractionState> {
        self.state.clone()
    }

    /// Subscribe to transition events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }
}

fn controller_gone() -> Error {
    Error::NotReady("voice controller stopped".to_string())
}

/// The controller actor
pub struct VoiceController {
    options: ControllerOptions,
    audio: Arc<AudioSessionManager>,
    detector: WakeWordDetector,
    capture: SpeechCaptureSession,
    mic: MicrophoneArbiter,
    speaker: Arc<dyn Speaker>,
    assistant: Arc<dyn Assistant>,
    http: reqwest::Client,
    bridge: Option<BridgeSender>,
    context: ConversationContext,

    internal: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<InteractionState>,
    events: broadcast::Sender<VoiceEvent>,
    state: InteractionState,
    published: InteractionState,

    phase: Phase,
    epoch: u64,
    enable_waiters: Vec<oneshot::Sender<Result<()>>>,
    turn: Turn,
    speech: Option<Speech>,
    speech_token: u64,
    external_speaking: bool,
    pending_reply: Option<u64>,
    reply_token: u64,
    last_wake: Option<Instant>,

    wake_indicator_until: Option<Instant>,
    inactivity_at: Option<Instant>,
    keep_alive_at: Option<Instant>,
}

struct Receivers {
    commands: mpsc::Receiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
    recognizer: mpsc::UnboundedReceiver<RecognizerMessage>,
    detector: mpsc::UnboundedReceiver<DetectorEvent>,
    bridge: Option<mpsc::UnboundedReceiver<WorkerMessage>>,
}

impl VoiceController {
    /// Spawn a controller and return its handle
    #[must_use]
    pub fn spawn(options: ControllerOptions, collaborators: Collaborators) -> VoiceHandle {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (recognizer_tx, recognizer) = mpsc::unbounded_channel();
        let (detector_tx, detector) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(InteractionState::default());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let (bridge, bridge_rx) = match collaborators.bridge {
            Some(client) => {
                let (sender, inbound) = client.into_split();
                (Some(sender), Some(inbound))
            }
            None => (None, None),
        };
        let keep_alive_at = bridge.as_ref().map(|_| Instant::now() + KEEP_ALIVE_INTERVAL);

        let controller = Self {
            context: ConversationContext::new(options.context_turns * 2),
            options,
            audio: Arc::new(AudioSessionManager::new(collaborators.platform)),
            detector: WakeWordDetector::new(
                collaborators.keyword_factory,
                collaborators.microphone,
                detector_tx,
            ),
            capture: SpeechCaptureSession::new(collaborators.recognizer, recognizer_tx),
            mic: MicrophoneArbiter::new(),
            speaker: collaborators.speaker,
            assistant: collaborators.assistant,
            http: collaborators.http,
            bridge,
            internal: internal_tx,
            state_tx,
            events: events.clone(),
            state: InteractionState::default(),
            published: InteractionState::default(),
            phase: Phase::Disabled,
            epoch: 0,
            enable_waiters: Vec::new(),
            turn: Turn::Idle,
            speech: None,
            speech_token: 0,
            external_speaking: false,
            pending_reply: None,
            reply_token: 0,
            last_wake: None,
            wake_indicator_until: None,
            inactivity_at: None,
            keep_alive_at,
        };

        let receivers = Receivers {
            commands,
            internal,
            recognizer,
            detector,
            bridge: bridge_rx,
        };
        tokio::spawn(controller.run(receivers));

        VoiceHandle {
            commands: command_tx,
            state: state_rx,
            events,
        }
    }

    async fn run(mut self, mut rx: Receivers) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = rx.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(internal) = rx.internal.recv() => self.on_internal(internal),
                Some(message) = rx.recognizer.recv() => {
                    let outputs = self.capture.handle(message, Instant::now());
                    self.apply_capture(outputs);
                }
                Some(event) = rx.detector.recv() => self.on_detector(event),
                message = recv_bridge(&mut rx.bridge), if rx.bridge.is_some() => match message {
                    Some(message) => self.on_bridge(message),
                    None => {
                        tracing::info!("bridge closed");
                        rx.bridge = None;
                        self.bridge = None;
                        self.keep_alive_at = None;
                    }
                },
                () = sleep_until(deadline) => self.on_timers(Instant::now()),
            }

            self.publish();
        }

        self.shutdown().await;
        tracing::debug!("voice controller stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.capture.next_deadline(),
            self.wake_indicator_until,
            self.inactivity_at,
            self.keep_alive_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Enable(reply) => self.enable(reply),
            Command::Disable(reply) => {
                self.disable().await;
                let _ = reply.send(());
            }
            Command::RequestPermission(reply) => {
                let audio = Arc::clone(&self.audio);
                let internal = self.internal.clone();
                tokio::spawn(async move {
                    let result = audio.request_microphone_permission().await;
                    let _ = internal.send(Internal::PermissionResolved { result, reply });
                });
            }
            Command::SubmitManualTranscript { text, reply } => {
                let _ = reply.send(self.submit_manual(text));
            }
            Command::StartManualCapture(reply) => {
                let _ = reply.send(self.start_manual_capture());
            }
            Command::StopCapture(reply) => {
                if matches!(self.turn, Turn::Capturing { .. }) && self.pending_reply.is_none() {
                    self.close_capture();
                }
                let _ = reply.send(());
            }
            Command::SetSpeaking { speaking, reply } => {
                self.set_external_speaking(speaking);
                let _ = reply.send(());
            }
            Command::SetVisibility { visible, reply } => {
                let audio = Arc::clone(&self.audio);
                let internal = self.internal.clone();
                let epoch = self.epoch;
                let should_listen = self.phase == Phase::Active;
                tokio::spawn(async move {
                    let action = audio.on_visibility_change(visible, should_listen).await;
                    let _ = internal.send(Internal::VisibilityResolved { epoch, action });
                });
                let _ = reply.send(());
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.audio.diagnostics(self.capture.recognizer_available()));
            }
            Command::SimulateWake(reply) => {
                let result = if self.phase == Phase::Active {
                    self.on_wake(WakeSource::Remote, Instant::now());
                    Ok(())
                } else {
                    Err(Error::NotReady("wake word listening is not enabled".to_string()))
                };
                let _ = reply.send(result);
            }
        }
    }

    fn enable(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.phase {
            Phase::Active => {
                let _ = reply.send(Ok(()));
                return;
            }
            Phase::Enabling => {
                self.enable_waiters.push(reply);
                return;
            }
            Phase::Disabled => {}
        }

        self.enable_waiters.push(reply);
        self.phase = Phase::Enabling;
        self.epoch += 1;
        self.detector.begin_initialize();
        tracing::info!(epoch = self.epoch, "enabling voice pipeline");

        let epoch = self.epoch;
        let audio = Arc::clone(&self.audio);
        let internal = self.internal.clone();
        let factory = self.detector.factory();
        let http = self.http.clone();
        let credential = self.options.credential.clone();
        let model = self.options.model.clone();
        let sensitivity = self.options.sensitivity;
        let speech_recognition = self.capture.recognizer_available();

        tokio::spawn(async move {
            let mut permission = None;
            let result = async {
                let snapshot = audio.diagnostics(speech_recognition);
                if let Some(e) = snapshot.environment_error() {
                    return Err(e);
                }

                let granted = audio.request_microphone_permission().await?;
                permission = Some(granted);
                if granted == PermissionState::Denied {
                    return Err(Error::Permission("microphone access denied".to_string()));
                }

                audio.ensure_audio_context(SAMPLE_RATE).await?;

                let credential = credential.ok_or_else(|| {
                    Error::Credential("no wake word access key configured".to_string())
                })?;
                let model = ModelSource::parse(&model)?;
                WakeWordDetector::prepare(factory, http, credential, model, sensitivity).await
            }
            .await;

            let _ = internal.send(Internal::EnableFinished {
                epoch,
                permission,
                result,
            });
        });
    }

    fn on_enable_finished(
        &mut self,
        permission: Option<PermissionState>,
        result: Result<Box<dyn KeywordEngine>>,
    ) {
        if let Some(permission) = permission {
            self.state.permission = permission;
        }

        match self.detector.install(result) {
            Ok(()) => {
                self.phase = Phase::Active;
                self.state.is_initialized = true;
                self.state.availability = Availability::Available;
                tracing::info!("voice pipeline enabled");
                self.resume_wake();
                for waiter in self.enable_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                self.phase = Phase::Disabled;
                self.state.is_initialized = false;
                self.state.availability = Availability::Unavailable {
                    reason: e.to_string(),
                };
                tracing::warn!(
                    error = %e,
                    fatal = e.is_fatal_for_pipeline(),
                    wake_word_only = e.is_wake_word_only(),
                    "voice pipeline unavailable, manual input only"
                );
                self.record_error(&e);
                self.notify_bridge(ClientMessage::FallbackModeActivated {
                    reason: Some(e.to_string()),
                });
                for waiter in self.enable_waiters.drain(..) {
                    let _ = waiter.send(Err(e.duplicate()));
                }
            }
        }
    }

    async fn disable(&mut self) {
        self.epoch += 1;
        self.speech_token += 1;
        self.reply_token += 1;

        self.capture.stop();
        self.mic.release(MicOwner::Capture);
        self.detector.release();
        self.mic.release(MicOwner::WakeWord);

        self.phase = Phase::Disabled;
        self.turn = Turn::Idle;
        self.speech = None;
        self.external_speaking = false;
        self.pending_reply = None;
        self.wake_indicator_until = None;
        self.inactivity_at = None;

        self.state = InteractionState {
            permission: self.state.permission,
            last_error: self.state.last_error.clone(),
            ..InteractionState::default()
        };

        for waiter in self.enable_waiters.drain(..) {
            let _ = waiter.send(Err(Error::NotReady(
                "disabled before initialization finished".to_string(),
            )));
        }

        self.audio.close().await;
        tracing::info!("voice pipeline disabled");
    }

    async fn shutdown(&mut self) {
        self.disable().await;
        self.publish();
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::EnableFinished {
                epoch,
                permission,
                result,
            } => {
                if epoch != self.epoch || self.phase != Phase::Enabling {
                    tracing::debug!(epoch, current = self.epoch, "dropping stale enable result");
                    return;
                }
                self.on_enable_finished(permission, result);
            }
            Internal::PermissionResolved { result, reply } => {
                match &result {
                    Ok(permission) => self.state.permission = *permission,
                    Err(e) => self.record_error(e),
                }
                let _ = reply.send(result);
            }
            Internal::SpeechFinished { token, result } => {
                if token != self.speech_token {
                    return;
                }
                self.on_speech_finished(result);
            }
            Internal::ReplyFinished {
                token,
                utterance,
                result,
            } => {
                if self.pending_reply != Some(token) {
                    tracing::debug!(token, "dropping stale assistant reply");
                    return;
                }
                self.on_reply(&utterance, result);
            }
            Internal::VisibilityResolved { epoch, action } => {
                if epoch != self.epoch || action != VisibilityAction::RestartCapture {
                    return;
                }
                self.restart_after_visible();
            }
        }
    }

    fn on_detector(&mut self, event: DetectorEvent) {
        if !self.detector.is_current(&event) {
            tracing::trace!(epoch = event.epoch(), "dropping stale detector event");
            return;
        }

        match event {
            DetectorEvent::Detected { .. } => self.on_wake(WakeSource::Local, Instant::now()),
            DetectorEvent::Failed { message, .. } => {
                self.suspend_wake();
                self.record_error(&Error::Audio(message));
            }
            DetectorEvent::StreamEnded { .. } => {
                tracing::warn!("microphone stream ended under the wake word detector");
                self.suspend_wake();
            }
        }
    }

    fn on_bridge(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::WakewordDetected { timestamp } => {
                tracing::debug!(timestamp, "wake relayed by bridge");
                if self.phase == Phase::Active {
                    self.on_wake(WakeSource::Remote, Instant::now());
                }
            }
            WorkerMessage::FallbackModeActive { reason, .. } => {
                tracing::info!(reason, "a front-end is in manual mode");
            }
            WorkerMessage::Pong => tracing::trace!("bridge pong"),
            WorkerMessage::SwUpdated { version, .. } => {
                tracing::info!(version, "bridge updated");
            }
            WorkerMessage::Focus => tracing::info!("focus requested by notification"),
        }
    }

    fn on_wake(&mut self, source: WakeSource, now: Instant) {
        if self
            .last_wake
            .is_some_and(|last| now.duration_since(last) < WAKE_REFRACTORY)
        {
            tracing::trace!(?source, "wake within refractory window");
            return;
        }
        if self.turn != Turn::Idle || self.external_speaking {
            tracing::debug!(?source, turn = ?self.turn, "wake ignored, busy");
            return;
        }

        tracing::info!(?source, "wake word");
        self.last_wake = Some(now);
        self.state.is_wake_detected = true;
        self.wake_indicator_until = Some(now + WAKE_INDICATOR);

        self.suspend_wake();
        if source == WakeSource::Local {
            self.notify_bridge(ClientMessage::WakewordDetected);
        }

        self.turn = Turn::Confirming;
        let phrase = self.options.confirmation_phrase.clone();
        self.speak(Speech::Confirmation, phrase);
    }

    fn speak(&mut self, kind: Speech, text: String) {
        self.speech_token += 1;
        self.speech = Some(kind);
        self.capture.pause();
        self.suspend_wake();
        self.update_speaking();

        let token = self.speech_token;
        let speaker = Arc::clone(&self.speaker);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = speaker.speak(&text).await;
            let _ = internal.send(Internal::SpeechFinished { token, result });
        });
    }

    fn on_speech_finished(&mut self, result: Result<()>) {
        let kind = self.speech.take();
        self.update_speaking();
        if let Err(e) = result {
            self.record_error(&e);
        }

        match kind {
            Some(Speech::Confirmation) if self.turn == Turn::Confirming => {
                if self.external_speaking {
                    // Capture opens once the other audio stops
                    return;
                }
                self.open_capture(self.options.mode, false);
            }
            Some(Speech::Reply) => self.finish_turn(),
            _ => {}
        }
    }

    fn set_external_speaking(&mut self, speaking: bool) {
        if self.external_speaking == speaking {
            return;
        }
        self.external_speaking = speaking;
        tracing::debug!(speaking, "external speech");

        if speaking {
            self.capture.pause();
            self.suspend_wake();
        } else if self.speech.is_none() {
            match self.turn {
                Turn::Confirming => self.open_capture(self.options.mode, false),
                Turn::Capturing { .. } => self.resume_capture(),
                Turn::Idle => self.resume_wake(),
                Turn::AwaitingReply => {}
            }
        }
        self.update_speaking();
    }

    fn update_speaking(&mut self) {
        self.state.is_speaking = self.speech.is_some() || self.external_speaking;
    }

    fn open_capture(&mut self, mode: CaptureMode, manual: bool) {
        self.suspend_wake();
        let opened = self
            .mic
            .acquire(MicOwner::Capture)
            .and_then(|()| self.capture.start(mode));

        match opened {
            Ok(()) => {
                self.turn = Turn::Capturing { manual };
                self.state.is_capturing = true;
                self.inactivity_at = Some(Instant::now() + INACTIVITY_TIMEOUT);
                tracing::debug!(%mode, manual, "capture opened");
            }
            Err(e) => {
                self.mic.release(MicOwner::Capture);
                self.record_error(&e);
                self.turn = Turn::Idle;
                self.resume_wake();
            }
        }
    }

    fn resume_capture(&mut self) {
        if let Err(e) = self.capture.resume() {
            self.record_error(&e);
            self.close_capture();
            return;
        }
        if self.capture.is_active() {
            self.inactivity_at = Some(Instant::now() + INACTIVITY_TIMEOUT);
        }
    }

    /// Stop the capture session and settle the turn
    fn close_capture(&mut self) {
        self.capture.stop();
        self.mic.release(MicOwner::Capture);
        self.state.is_capturing = false;
        self.state.interim = None;
        self.inactivity_at = None;

        if matches!(self.turn, Turn::Capturing { .. }) {
            if self.pending_reply.is_some() {
                self.turn = Turn::AwaitingReply;
            } else {
                self.turn = Turn::Idle;
                self.resume_wake();
            }
        }
    }

    fn apply_capture(&mut self, outputs: Vec<CaptureOutput>) {
        for output in outputs {
            match output {
                CaptureOutput::Interim(text) => {
                    if !text.is_empty() {
                        self.emit(VoiceEvent::Interim { text: text.clone() });
                    }
                    self.state.interim = Some(text);
                }
                CaptureOutput::Commit(text) => self.commit(text),
                CaptureOutput::Error(kind) => {
                    if kind == RecognitionErrorKind::PermissionDenied {
                        self.state.permission = PermissionState::Denied;
                    }
                    self.record_error(&kind.to_error());
                    self.close_capture();
                }
                CaptureOutput::Restarted => {
                    tracing::trace!(generation = self.capture.generation(), "capture restarted");
                }
                CaptureOutput::Ended => {
                    if self.state.is_capturing {
                        self.close_capture();
                    }
                }
            }
        }
    }

    /// Forward a transcript to the assistant
    fn commit(&mut self, text: String) {
        self.inactivity_at = None;
        self.state.interim = None;
        tracing::info!(text = %text, "forwarding transcript");
        self.emit(VoiceEvent::Committed { text: text.clone() });

        self.reply_token += 1;
        let token = self.reply_token;
        self.pending_reply = Some(token);

        let keep_open = self.turn == (Turn::Capturing { manual: false })
            && self.capture.mode() == CaptureMode::Continuous;
        if !keep_open {
            if matches!(self.turn, Turn::Capturing { .. }) {
                self.close_capture();
            } else {
                self.turn = Turn::AwaitingReply;
            }
        }

        let assistant = Arc::clone(&self.assistant);
        let context = self.context.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = match assistant.submit(&text, &context).await {
                Ok(stream) => collect_reply(stream).await,
                Err(e) => Err(e),
            };
            let _ = internal.send(Internal::ReplyFinished {
                token,
                utterance: text,
                result,
            });
        });
    }

    fn on_reply(&mut self, utterance: &str, result: Result<String>) {
        self.pending_reply = None;
        self.capture.commit_done();

        match result {
            Ok(reply) => {
                self.context.record(utterance, &reply);
                self.emit(VoiceEvent::Reply {
                    text: reply.clone(),
                });
                if self.options.speak_replies && !reply.is_empty() {
                    self.speak(Speech::Reply, reply);
                    return;
                }
            }
            Err(e) => self.record_error(&e),
        }
        self.finish_turn();
    }

    /// Continuous capture keeps going; everything else returns to wake listening
    fn finish_turn(&mut self) {
        match self.turn {
            Turn::Capturing { .. } if !self.external_speaking => self.resume_capture(),
            Turn::Capturing { .. } => {}
            Turn::AwaitingReply | Turn::Confirming => {
                self.turn = Turn::Idle;
                self.resume_wake();
            }
            Turn::Idle => self.resume_wake(),
        }
    }

    fn submit_manual(&mut self, text: String) -> Result<()> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(Error::Recognition("empty transcript".to_string()));
        }
        if self.pending_reply.is_some() || self.turn == Turn::Confirming {
            return Err(Error::NotReady("a reply is still pending".to_string()));
        }

        if self.turn == Turn::Idle {
            self.suspend_wake();
        }
        self.commit(text);
        Ok(())
    }

    fn start_manual_capture(&mut self) -> Result<()> {
        match self.turn {
            Turn::Capturing { .. } if self.pending_reply.is_none() => return Ok(()),
            Turn::Idle => {}
            _ => return Err(Error::NotReady("a turn is already in progress".to_string())),
        }
        if !self.capture.recognizer_available() {
            return Err(Error::Environment(
                "speech recognition is unavailable".to_string(),
            ));
        }

        self.open_capture(CaptureMode::SingleShot, true);
        if matches!(self.turn, Turn::Capturing { .. }) {
            Ok(())
        } else {
            Err(Error::Recognition("capture could not start".to_string()))
        }
    }

    fn restart_after_visible(&mut self) {
        if self.phase != Phase::Active {
            return;
        }
        match self.turn {
            Turn::Idle if !self.detector.is_listening() => self.resume_wake(),
            Turn::Capturing { .. }
                if !self.capture.is_active() && !self.capture.is_paused() =>
            {
                let manual = matches!(self.turn, Turn::Capturing { manual: true });
                let mode = if manual {
                    CaptureMode::SingleShot
                } else {
                    self.options.mode
                };
                self.mic.release(MicOwner::Capture);
                self.open_capture(mode, manual);
            }
            _ => {}
        }
    }

    fn on_timers(&mut self, now: Instant) {
        let outputs = self.capture.poll(now);
        self.apply_capture(outputs);

        if self.wake_indicator_until.is_some_and(|at| at <= now) {
            self.wake_indicator_until = None;
            self.state.is_wake_detected = false;
        }

        if self.inactivity_at.is_some_and(|at| at <= now) {
            self.inactivity_at = None;
            if matches!(self.turn, Turn::Capturing { .. }) && self.pending_reply.is_none() {
                tracing::info!("no speech, back to wake listening");
                self.close_capture();
            }
        }

        if self.keep_alive_at.is_some_and(|at| at <= now) {
            self.keep_alive_at = Some(now + KEEP_ALIVE_INTERVAL);
            self.notify_bridge(ClientMessage::KeepAlive);
        }
    }

    /// Start the detector if the pipeline is idle
    fn resume_wake(&mut self) {
        if self.phase != Phase::Active
            || self.turn != Turn::Idle
            || self.speech.is_some()
            || self.external_speaking
        {
            return;
        }
        if let Err(e) = self.mic.acquire(MicOwner::WakeWord) {
            tracing::warn!(error = %e, "cannot resume wake word");
            return;
        }

        match self.detector.start() {
            Ok(_) => {
                self.state.is_listening = true;
                let audio = Arc::clone(&self.audio);
                let lease = audio.wake_lock_lease();
                tokio::spawn(async move { audio.acquire_wake_lock(lease).await });
            }
            Err(e) => {
                self.mic.release(MicOwner::WakeWord);
                self.state.is_listening = false;
                self.record_error(&e);
            }
        }
    }

    fn suspend_wake(&mut self) {
        self.detector.stop();
        self.mic.release(MicOwner::WakeWord);
        self.state.is_listening = false;
        tokio::spawn(self.audio.revoke_wake_lock());
    }

    fn notify_bridge(&self, message: ClientMessage) {
        if let Some(bridge) = &self.bridge
            && let Err(e) = bridge.send(message)
        {
            tracing::debug!(error = %e, "bridge unreachable");
        }
    }

    fn record_error(&mut self, error: &Error) {
        tracing::warn!(error = %error, "voice error");
        self.state.last_error = Some(error.to_string());
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        debug_assert!(
            !(self.state.is_listening && self.state.is_capturing),
            "wake word and capture both hold the microphone"
        );
        if self.state == self.published {
            return;
        }
        for event in diff(&self.published, &self.state) {
            self.emit(event);
        }
        self.published = self.state.clone();
        self.state_tx.send_replace(self.state.clone());
    }
}

async fn recv_bridge(
    rx: &mut Option<mpsc::UnboundedReceiver<WorkerMessage>>,
) -> Option<WorkerMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
