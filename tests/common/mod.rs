//! Shared test doubles

#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

use benji_voice::assistant::{Assistant, ConversationContext, ReplyStream};
use benji_voice::bridge::BridgeClient;
use benji_voice::voice::{
    AudioContextHandle, AudioContextState, AudioPlatform, CaptureMode, Collaborators,
    ControllerOptions, FrameSource, FrameSubscription, InteractionState, KeywordEngine,
    KeywordEngineFactory, PermissionState, RecognitionSegment, RecognizerEvent, RecognizerMessage,
    SpeechRecognizer, Speaker, VoiceController, VoiceHandle,
};
use benji_voice::{Error, Result};

/// Frame the fake engine recognizes as the wake word
#[must_use]
pub fn wake_frame() -> Vec<i16> {
    let mut frame = vec![0i16; 512];
    frame[0] = i16::MAX;
    frame
}

/// Fires whenever the first sample of a frame is `i16::MAX`
pub struct FakeEngine;

impl KeywordEngine for FakeEngine {
    fn frame_length(&self) -> usize {
        512
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn process(&mut self, frame: &[i16]) -> Result<bool> {
        Ok(frame.first() == Some(&i16::MAX))
    }
}

#[derive(Default)]
pub struct FakeEngineFactory {
    pub created: AtomicUsize,
}

impl KeywordEngineFactory for FakeEngineFactory {
    fn create(
        &self,
        credential: &SecretString,
        _model: &[u8],
        _sensitivity: f32,
    ) -> Result<Box<dyn KeywordEngine>> {
        use secrecy::ExposeSecret;
        if credential.expose_secret().is_empty() {
            return Err(Error::Credential("rejected".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine))
    }
}

/// Microphone whose frames are pushed by the test
#[derive(Default)]
pub struct FakeFrameSource {
    senders: Mutex<Vec<mpsc::Sender<Vec<i16>>>>,
    pub opens: AtomicUsize,
}

impl FakeFrameSource {
    /// Deliver a frame to every open subscription
    pub fn push(&self, frame: &[i16]) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            let _ = tx.try_send(frame.to_vec());
        }
    }

    pub fn push_wake(&self) {
        self.push(&wake_frame());
    }

    /// Close every open subscription, as an unplugged device would
    pub fn end_streams(&self) {
        self.senders.lock().unwrap().clear();
    }

    /// Subscriptions still open
    pub fn live(&self) -> usize {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }
}

impl FrameSource for FakeFrameSource {
    fn open(&self, _sample_rate: u32, _frame_length: usize) -> Result<FrameSubscription> {
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().unwrap().push(tx);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(FrameSubscription::new(rx, None))
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct RecognizerLogInner {
    starts: Vec<(u64, bool)>,
    stops: usize,
    generation: u64,
    sender: Option<mpsc::UnboundedSender<RecognizerMessage>>,
}

/// Test-side view of a [`FakeRecognizer`]
#[derive(Clone, Default)]
pub struct RecognizerLog(Arc<Mutex<RecognizerLogInner>>);

impl RecognizerLog {
    /// Emit an event for the current run
    pub fn send(&self, event: RecognizerEvent) {
        let inner = self.0.lock().unwrap();
        if let Some(tx) = &inner.sender {
            let _ = tx.send(RecognizerMessage {
                generation: inner.generation,
                event,
            });
        }
    }

    /// Emit an event tagged with an explicit generation
    pub fn send_with_generation(&self, generation: u64, event: RecognizerEvent) {
        let inner = self.0.lock().unwrap();
        if let Some(tx) = &inner.sender {
            let _ = tx.send(RecognizerMessage { generation, event });
        }
    }

    pub fn say(&self, text: &str) {
        self.send(RecognizerEvent::Result {
            segments: vec![RecognitionSegment::final_text(text)],
        });
    }

    pub fn generation(&self) -> u64 {
        self.0.lock().unwrap().generation
    }

    pub fn starts(&self) -> Vec<(u64, bool)> {
        self.0.lock().unwrap().starts.clone()
    }

    pub fn stops(&self) -> usize {
        self.0.lock().unwrap().stops
    }
}

pub struct FakeRecognizer {
    record: RecognizerLog,
}

impl FakeRecognizer {
    pub fn new() -> (Self, RecognizerLog) {
        let record = RecognizerLog::default();
        (
            Self {
                record: record.clone(),
            },
            record,
        )
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start(
        &mut self,
        generation: u64,
        continuous: bool,
        events: mpsc::UnboundedSender<RecognizerMessage>,
    ) -> Result<()> {
        let mut inner = self.record.0.lock().unwrap();
        inner.starts.push((generation, continuous));
        inner.generation = generation;
        inner.sender = Some(events);
        Ok(())
    }

    fn stop(&mut self) {
        self.record.0.lock().unwrap().stops += 1;
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Records what was spoken; each utterance takes `duration`
#[derive(Default)]
pub struct FakeSpeaker {
    pub spoken: Mutex<Vec<String>>,
    pub duration: Duration,
}

impl FakeSpeaker {
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl Speaker for FakeSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        Ok(())
    }
}

/// Replies with a fixed text in two chunks
pub struct FakeAssistant {
    pub reply: String,
    pub calls: Mutex<Vec<String>>,
}

impl FakeAssistant {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Assistant for FakeAssistant {
    async fn submit(&self, utterance: &str, _context: &ConversationContext) -> Result<ReplyStream> {
        self.calls.lock().unwrap().push(utterance.to_string());
        let (head, tail) = self.reply.split_at(self.reply.len() / 2);
        let chunks = vec![Ok(head.to_string()), Ok(tail.to_string())];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Platform with every capability present
pub struct FakePlatform {
    pub permission: Option<PermissionState>,
    pub mic_refused: bool,
    pub secure: bool,
    /// Time the audio context takes to come up
    pub context_delay: Duration,
    pub wake_locks: AtomicUsize,
    pub released_locks: AtomicUsize,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            permission: Some(PermissionState::Granted),
            mic_refused: false,
            secure: true,
            context_delay: Duration::ZERO,
            wake_locks: AtomicUsize::new(0),
            released_locks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AudioPlatform for FakePlatform {
    fn is_secure_context(&self) -> bool {
        self.secure
    }

    fn has_microphone_api(&self) -> bool {
        true
    }

    fn has_audio_context(&self) -> bool {
        true
    }

    async fn query_permission(&self) -> Option<PermissionState> {
        self.permission
    }

    async fn try_microphone(&self) -> Result<()> {
        if self.mic_refused {
            Err(Error::Permission("blocked".to_string()))
        } else {
            Ok(())
        }
    }

    async fn create_audio_context(&self, sample_rate: u32) -> Result<AudioContextHandle> {
        if !self.context_delay.is_zero() {
            tokio::time::sleep(self.context_delay).await;
        }
        Ok(AudioContextHandle { id: 1, sample_rate })
    }

    async fn resume_audio_context(&self, _handle: AudioContextHandle) -> Result<()> {
        Ok(())
    }

    fn audio_context_state(&self, _handle: AudioContextHandle) -> AudioContextState {
        AudioContextState::Running
    }

    async fn close_audio_context(&self, _handle: AudioContextHandle) {}

    async fn request_wake_lock(&self) -> Result<bool> {
        self.wake_locks.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release_wake_lock(&self) {
        self.released_locks.fetch_add(1, Ordering::SeqCst);
    }
}

/// A keyword model file large enough to pass the size check
pub fn model_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[7u8; 2048]).unwrap();
    file
}

/// Controller wired to fakes
pub struct Harness {
    pub handle: VoiceHandle,
    pub mic: Arc<FakeFrameSource>,
    pub recognizer: RecognizerLog,
    pub speaker: Arc<FakeSpeaker>,
    pub assistant: Arc<FakeAssistant>,
    pub platform: Arc<FakePlatform>,
    pub model: tempfile::NamedTempFile,
}

pub struct HarnessBuilder {
    pub mode: CaptureMode,
    pub credential: Option<&'static str>,
    pub platform: FakePlatform,
    pub speaker: FakeSpeaker,
    pub speak_replies: bool,
    pub bridge: Option<BridgeClient>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            mode: CaptureMode::SingleShot,
            credential: Some("test-key"),
            platform: FakePlatform::default(),
            speaker: FakeSpeaker::default(),
            speak_replies: true,
            bridge: None,
        }
    }
}

impl HarnessBuilder {
    pub fn build(self) -> Harness {
        let model = model_file();
        let mic = Arc::new(FakeFrameSource::default());
        let (recognizer, record) = FakeRecognizer::new();
        let speaker = Arc::new(self.speaker);
        let assistant = Arc::new(FakeAssistant::new("C'est noté, rendez-vous demain à 14h."));
        let platform = Arc::new(self.platform);

        let options = ControllerOptions {
            credential: self.credential.map(|c| SecretString::from(c.to_string())),
            model: model.path().display().to_string(),
            sensitivity: 0.5,
            mode: self.mode,
            confirmation_phrase: "Oui ?".to_string(),
            speak_replies: self.speak_replies,
            context_turns: 5,
        };

        let collaborators = Collaborators {
            keyword_factory: Arc::new(FakeEngineFactory::default()),
            microphone: Arc::clone(&mic) as Arc<dyn FrameSource>,
            recognizer: Box::new(recognizer),
            speaker: Arc::clone(&speaker) as Arc<dyn Speaker>,
            assistant: Arc::clone(&assistant) as Arc<dyn Assistant>,
            platform: Arc::clone(&platform) as Arc<dyn AudioPlatform>,
            http: reqwest::Client::new(),
            bridge: self.bridge,
        };

        Harness {
            handle: VoiceController::spawn(options, collaborators),
            mic,
            recognizer: record,
            speaker,
            assistant,
            platform,
            model,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&InteractionState) -> bool) -> InteractionState {
        let mut rx = self.handle.watch();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for state")
            .expect("controller stopped")
            .clone()
    }

    /// Enable and wait for wake listening
    pub async fn enable(&self) {
        self.handle.enable().await.unwrap();
        self.wait_for(|s| s.is_listening).await;
    }

    /// Poll `check` until it holds
    pub async fn eventually(&self, mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    /// Wake through the detector and wait for the capture to open
    pub async fn wake_and_capture(&self) {
        self.mic.push_wake();
        self.wait_for(|s| s.is_capturing).await;
    }
}
