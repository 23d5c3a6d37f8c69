//! Wake word detection
//!
//! [`WakeWordDetector`] owns one keyword engine and feeds it microphone frames
//! while listening. Detections are delivered as [`DetectorEvent`]s tagged with
//! the listening epoch so the consumer can drop events raised before a stop.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::keyword::{KeywordEngine, KeywordEngineFactory, MIN_MODEL_BYTES};
use super::microphone::FrameSource;
use crate::{Error, Result};

/// The phrase the bundled model is trained on
pub const WAKE_PHRASE: &str = "Hello Benji";

/// Lifecycle of a wake word session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeWordStatus {
    Uninitialized,
    Initializing,
    Ready,
    Listening,
    Suspended,
    Released,
    Failed,
}

/// Events raised by the detector task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// The keyword was spotted
    Detected { epoch: u64 },
    /// The engine failed on a frame; listening stopped
    Failed { epoch: u64, message: String },
    /// The microphone stream closed underneath the detector
    StreamEnded { epoch: u64 },
}

impl DetectorEvent {
    /// Listening epoch the event belongs to
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        match self {
            Self::Detected { epoch }
            | Self::Failed { epoch, .. }
            | Self::StreamEnded { epoch } => *epoch,
        }
    }
}

/// Where the keyword model bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    File(PathBuf),
    Url(Url),
}

impl ModelSource {
    /// Interpret a configured locator; http(s) URLs are fetched, anything
    /// else is a file path
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` if an http(s) locator is not a valid URL
    pub fn parse(locator: &str) -> Result<Self> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            Url::parse(locator)
                .map(Self::Url)
                .map_err(|e| Error::ModelLoad(format!("invalid model URL {locator:?}: {e}")))
        } else {
            Ok(Self::File(PathBuf::from(locator)))
        }
    }

    /// Fetch the model bytes and check they are large enough to be a model
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` if the model is unreachable or too small
    pub async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::File(path) => tokio::fs::read(path).await.map_err(|e| {
                let hint = if e.kind() == std::io::ErrorKind::NotFound {
                    " (run `benji enroll` to record one)"
                } else {
                    ""
                };
                Error::ModelLoad(format!("cannot read {}: {e}{hint}", path.display()))
            })?,
            Self::Url(url) => {
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| Error::ModelLoad(format!("cannot fetch {url}: {e}")))?;

                if !response.status().is_success() {
                    return Err(Error::ModelLoad(format!(
                        "cannot fetch {url}: HTTP {}",
                        response.status()
                    )));
                }

                response
                    .bytes()
                    .await
                    .map_err(|e| Error::ModelLoad(format!("cannot read {url}: {e}")))?
                    .to_vec()
            }
        };

        if bytes.len() < MIN_MODEL_BYTES {
            return Err(Error::ModelLoad(format!(
                "model too small ({} bytes)",
                bytes.len()
            )));
        }

        tracing::debug!(bytes = bytes.len(), "keyword model loaded");
        Ok(bytes)
    }
}

type SharedEngine = Arc<Mutex<Box<dyn KeywordEngine>>>;

/// Detects the wake phrase in the microphone stream
pub struct WakeWordDetector {
    factory: Arc<dyn KeywordEngineFactory>,
    source: Arc<dyn FrameSource>,
    events: mpsc::UnboundedSender<DetectorEvent>,
    engine: Option<SharedEngine>,
    task: Option<JoinHandle<()>>,
    status: WakeWordStatus,
    epoch: u64,
}

impl WakeWordDetector {
    /// Create an uninitialized detector
    #[must_use]
    pub fn new(
        factory: Arc<dyn KeywordEngineFactory>,
        source: Arc<dyn FrameSource>,
        events: mpsc::UnboundedSender<DetectorEvent>,
    ) -> Self {
        Self {
            factory,
            source,
            events,
            engine: None,
            task: None,
            status: WakeWordStatus::Uninitialized,
            epoch: 0,
        }
    }

    /// Load the model and build an engine without touching detector state
    ///
    /// Split out so callers can run it as a background task and hand the
    /// result to [`Self::install`].
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` or `Error::Credential`
    pub async fn prepare(
        factory: Arc<dyn KeywordEngineFactory>,
        client: reqwest::Client,
        credential: SecretString,
        model: ModelSource,
        sensitivity: f32,
    ) -> Result<Box<dyn KeywordEngine>> {
        let bytes = model.fetch(&client).await?;
        factory.create(&credential, &bytes, sensitivity.clamp(0.0, 1.0))
    }

    /// Factory used to build engines
    #[must_use]
    pub fn factory(&self) -> Arc<dyn KeywordEngineFactory> {
        Arc::clone(&self.factory)
    }

    /// Mark the detector as initializing; any previous engine is released
    pub fn begin_initialize(&mut self) {
        self.stop();
        self.engine = None;
        self.status = WakeWordStatus::Initializing;
    }

    /// Install the outcome of [`Self::prepare`]
    ///
    /// # Errors
    ///
    /// Returns the preparation error after moving to `Failed`
    pub fn install(&mut self, prepared: Result<Box<dyn KeywordEngine>>) -> Result<()> {
        match prepared {
            Ok(engine) => {
                tracing::info!(
                    frame_length = engine.frame_length(),
                    sample_rate = engine.sample_rate(),
                    "wake word engine ready"
                );
                self.engine = Some(Arc::new(Mutex::new(engine)));
                self.status = WakeWordStatus::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "wake word initialization failed");
                self.engine = None;
                self.status = WakeWordStatus::Failed;
                Err(e)
            }
        }
    }

    /// Fetch the model and create the engine in one step
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` or `Error::Credential`
    pub async fn initialize(
        &mut self,
        client: reqwest::Client,
        credential: SecretString,
        model: ModelSource,
        sensitivity: f32,
    ) -> Result<()> {
        self.begin_initialize();
        let prepared =
            Self::prepare(self.factory(), client, credential, model, sensitivity).await;
        self.install(prepared)
    }

    /// Start feeding microphone frames to the engine
    ///
    /// Returns `Ok(true)` once listening, including when already listening.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotReady` before initialization or after release, and
    /// an audio error if the microphone cannot be opened
    pub fn start(&mut self) -> Result<bool> {
        if self.status == WakeWordStatus::Listening {
            return Ok(true);
        }

        let engine = match (&self.engine, self.status) {
            (Some(engine), WakeWordStatus::Ready | WakeWordStatus::Suspended) => {
                Arc::clone(engine)
            }
            (_, status) => {
                return Err(Error::NotReady(format!(
                    "wake word detector is {status:?}"
                )));
            }
        };

        let (frame_length, sample_rate) = {
            let guard = engine
                .lock()
                .map_err(|_| Error::Audio("keyword engine lock poisoned".to_string()))?;
            (guard.frame_length(), guard.sample_rate())
        };

        let mut frames = self.source.open(sample_rate, frame_length)?;

        self.epoch += 1;
        let epoch = self.epoch;
        let events = self.events.clone();

        self.task = Some(tokio::spawn(async move {
            while let Some(frame) = frames.next_frame().await {
                let outcome = match engine.lock() {
                    Ok(mut guard) => guard.process(&frame),
                    Err(_) => Err(Error::Audio("keyword engine lock poisoned".to_string())),
                };

                match outcome {
                    Ok(true) => {
                        tracing::info!(epoch, "wake word detected");
                        if events.send(DetectorEvent::Detected { epoch }).is_err() {
                            return;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        let _ = events.send(DetectorEvent::Failed {
                            epoch,
                            message: e.to_string(),
                        });
                        return;
                    }
                }
            }
            let _ = events.send(DetectorEvent::StreamEnded { epoch });
        }));

        self.status = WakeWordStatus::Listening;
        tracing::debug!(epoch, "wake word listening");
        Ok(true)
    }

    /// Stop feeding frames; the microphone is closed. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(epoch = self.epoch, "wake word listening stopped");
        }
        if self.status == WakeWordStatus::Listening {
            self.status = WakeWordStatus::Suspended;
        }
    }

    /// Free the engine; `start` fails until re-initialized
    pub fn release(&mut self) {
        self.stop();
        if self.engine.take().is_some() {
            tracing::debug!("wake word engine released");
        }
        self.status = WakeWordStatus::Released;
    }

    /// Current lifecycle status
    #[must_use]
    pub const fn status(&self) -> WakeWordStatus {
        self.status
    }

    /// Whether frames are currently being processed
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.status == WakeWordStatus::Listening
    }

    /// Whether an event belongs to the current listening run
    #[must_use]
    pub fn is_current(&self, event: &DetectorEvent) -> bool {
        self.is_listening() && event.epoch() == self.epoch
    }
}

impl Drop for WakeWordDetector {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
