//! Microphone access
//!
//! The physical microphone is exposed as a [`FrameSource`] delivering fixed-size
//! 16-bit frames. Ownership between the wake word detector and speech capture
//! is tracked by [`MicrophoneArbiter`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech and keyword spotting)
pub const SAMPLE_RATE: u32 = 16_000;

/// Frames buffered between the audio thread and the consumer
const FRAME_QUEUE_DEPTH: usize = 64;

/// Source of microphone frames
pub trait FrameSource: Send + Sync {
    /// Open the input and start delivering frames of `frame_length` samples
    ///
    /// # Errors
    ///
    /// Returns error if the input device cannot be opened
    fn open(&self, sample_rate: u32, frame_length: usize) -> Result<FrameSubscription>;

    /// Whether an input device is present at all
    fn is_available(&self) -> bool;
}

/// Live subscription to a frame source; dropping it closes the input
pub struct FrameSubscription {
    frames: mpsc::Receiver<Vec<i16>>,
    stop: Option<std::sync::mpsc::Sender<()>>,
}

impl FrameSubscription {
    /// Wrap a frame receiver, with an optional stop signal for the producer
    #[must_use]
    pub const fn new(
        frames: mpsc::Receiver<Vec<i16>>,
        stop: Option<std::sync::mpsc::Sender<()>>,
    ) -> Self {
        Self { frames, stop }
    }

    /// Wait for the next frame; `None` once the input has closed
    pub async fn next_frame(&mut self) -> Option<Vec<i16>> {
        self.frames.recv().await
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Default input device through cpal
///
/// cpal streams aren't `Send`, so each subscription owns a dedicated thread
/// that keeps the stream alive until the subscription is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl FrameSource for CpalMicrophone {
    fn open(&self, sample_rate: u32, frame_length: usize) -> Result<FrameSubscription> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("benji-mic".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, frame_length, frame_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blocks until the subscription is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("microphone stream closed");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("microphone thread exited".to_string()))??;

        tracing::debug!(sample_rate, frame_length, "microphone stream opened");
        Ok(FrameSubscription::new(frame_rx, Some(stop_tx)))
    }

    fn is_available(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }
}

/// Build and start a mono input stream that emits fixed-size i16 frames
fn build_input_stream(
    sample_rate: u32,
    frame_length: usize,
    frames: mpsc::Sender<Vec<i16>>,
) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio capture initialized"
    );

    let mut pending: Vec<i16> = Vec::with_capacity(frame_length * 2);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                pending.extend(data.iter().map(|&s| f32_to_i16(s)));
                while pending.len() >= frame_length {
                    let frame: Vec<i16> = pending.drain(..frame_length).collect();
                    if frames.try_send(frame).is_err() {
                        tracing::trace!("frame queue full, dropping frame");
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[allow(clippy::cast_possible_truncation)]
fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Which component currently holds the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicOwner {
    /// Wake word detector
    WakeWord,
    /// Speech capture session
    Capture,
}

/// Single-owner bookkeeping for the physical microphone
///
/// The controller always releases one owner before acquiring for the other.
#[derive(Debug, Default)]
pub struct MicrophoneArbiter {
    owner: Option<MicOwner>,
    handoffs: u64,
}

impl MicrophoneArbiter {
    /// Create an arbiter with no owner
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: None,
            handoffs: 0,
        }
    }

    /// Take ownership for `who`
    ///
    /// # Errors
    ///
    /// Returns error if another component still holds the microphone
    pub fn acquire(&mut self, who: MicOwner) -> Result<()> {
        match self.owner {
            Some(current) if current == who => Ok(()),
            Some(current) => Err(Error::Audio(format!(
                "microphone held by {current:?}, cannot hand to {who:?}"
            ))),
            None => {
                self.owner = Some(who);
                self.handoffs += 1;
                tracing::trace!(owner = ?who, "microphone acquired");
                Ok(())
            }
        }
    }

    /// Release ownership if `who` holds it; no-op otherwise
    pub fn release(&mut self, who: MicOwner) {
        if self.owner == Some(who) {
            self.owner = None;
            tracing::trace!(owner = ?who, "microphone released");
        }
    }

    /// Current owner
    #[must_use]
    pub const fn owner(&self) -> Option<MicOwner> {
        self.owner
    }

    /// Number of successful acquisitions so far
    #[must_use]
    pub const fn handoffs(&self) -> u64 {
        self.handoffs
    }
}

/// Convert i16 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// RMS energy of 16-bit samples, normalized to [0.0, 1.0]
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn frame_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}
