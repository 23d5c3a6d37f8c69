//! Offline keyword spotting engine
//!
//! The engine trait is what the wake word detector drives; [`EnergyKeywordEngine`]
//! is the built-in implementation matching mel-spaced spectral envelopes
//! against a compiled keyword template. Model layout (little endian):
//!
//! ```text
//! "BNJW" | version u16 | frames u16 | bands u16 | frames*bands f32
//! ```

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use secrecy::{ExposeSecret, SecretString};

use super::microphone::{SAMPLE_RATE, frame_energy};
use crate::{Error, Result};

/// Minimum size for a keyword model to be considered valid
pub const MIN_MODEL_BYTES: usize = 1024;

/// Samples per frame fed to the engine (32 ms at 16kHz)
pub const FRAME_LENGTH: usize = 512;

const MODEL_MAGIC: &[u8; 4] = b"BNJW";
const MODEL_VERSION: u16 = 1;
const HEADER_LEN: usize = 10;

/// Frames ignored after a detection so one utterance fires once
const REFRACTORY_FRAMES: usize = 31; // ~1 second

/// Band count used when enrolling a phrase
pub const DEFAULT_BANDS: usize = 16;

/// Frames quieter than this are trimmed from an enrolment recording
const ENROLL_GATE: f32 = 0.02;

/// A keyword spotting engine fed with fixed-size frames
pub trait KeywordEngine: Send {
    /// Samples expected per frame
    fn frame_length(&self) -> usize;

    /// Sample rate the engine expects
    fn sample_rate(&self) -> u32;

    /// Process one frame; returns true when the keyword was spotted
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be processed
    fn process(&mut self, frame: &[i16]) -> Result<bool>;
}

/// Creates engines from a credential and model bytes
pub trait KeywordEngineFactory: Send + Sync {
    /// Build an engine
    ///
    /// # Errors
    ///
    /// Returns `Error::Credential` if the credential is rejected and
    /// `Error::ModelLoad` if the model is unusable
    fn create(
        &self,
        credential: &SecretString,
        model: &[u8],
        sensitivity: f32,
    ) -> Result<Box<dyn KeywordEngine>>;
}

/// Parsed keyword template
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordModel {
    bands: usize,
    frames: Vec<Vec<f32>>,
}

impl KeywordModel {
    /// Build a model from band-energy frames
    ///
    /// # Errors
    ///
    /// Returns error if the template is empty or frames have unequal widths
    pub fn new(frames: Vec<Vec<f32>>) -> Result<Self> {
        let bands = frames.first().map_or(0, Vec::len);
        if bands == 0 || frames.iter().any(|f| f.len() != bands) {
            return Err(Error::ModelLoad("keyword template is empty or ragged".to_string()));
        }
        Ok(Self { bands, frames })
    }

    /// Parse compiled model bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` if the bytes are not a valid model
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_MODEL_BYTES {
            return Err(Error::ModelLoad(format!(
                "model too small ({} bytes, need at least {MIN_MODEL_BYTES})",
                bytes.len()
            )));
        }
        if &bytes[..4] != MODEL_MAGIC {
            return Err(Error::ModelLoad("not a keyword model".to_string()));
        }

        let read_u16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let version = read_u16(4);
        if version != MODEL_VERSION {
            return Err(Error::ModelLoad(format!("unsupported model version {version}")));
        }
        let frame_count = usize::from(read_u16(6));
        let bands = usize::from(read_u16(8));

        let needed = HEADER_LEN + frame_count * bands * 4;
        if frame_count == 0 || bands == 0 || bytes.len() < needed {
            return Err(Error::ModelLoad("truncated keyword model".to_string()));
        }

        let frames = bytes[HEADER_LEN..needed]
            .chunks_exact(bands * 4)
            .map(|row| {
                row.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            })
            .collect();

        Self::new(frames)
    }

    /// Serialize to the compiled layout, zero-padded to the minimum size
    ///
    /// # Errors
    ///
    /// Returns error if the template dimensions don't fit the header
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let frames = u16::try_from(self.frames.len())
            .map_err(|_| Error::ModelLoad("too many template frames".to_string()))?;
        let bands = u16::try_from(self.bands)
            .map_err(|_| Error::ModelLoad("too many template bands".to_string()))?;

        let mut out = Vec::with_capacity(MIN_MODEL_BYTES);
        out.extend_from_slice(MODEL_MAGIC);
        out.extend_from_slice(&MODEL_VERSION.to_le_bytes());
        out.extend_from_slice(&frames.to_le_bytes());
        out.extend_from_slice(&bands.to_le_bytes());
        for frame in &self.frames {
            for v in frame {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        if out.len() < MIN_MODEL_BYTES {
            out.resize(MIN_MODEL_BYTES, 0);
        }
        Ok(out)
    }

    /// Derive a template from example audio of the phrase
    ///
    /// # Errors
    ///
    /// Returns error if the audio is shorter than one frame
    pub fn from_samples(samples: &[i16], bands: usize) -> Result<Self> {
        let mut analyzer = SpectralEnvelope::new(bands);
        let frames = samples
            .chunks_exact(FRAME_LENGTH)
            .filter(|frame| frame_energy(frame) > 0.0)
            .map(|frame| analyzer.analyze(frame))
            .collect();
        Self::new(frames)
    }

    /// Enrol a phrase from a microphone recording
    ///
    /// Leading and trailing quiet frames are dropped before the template is
    /// derived.
    ///
    /// # Errors
    ///
    /// Returns `Error::ModelLoad` if nothing in the recording is loud enough
    pub fn from_recording(samples: &[i16], bands: usize) -> Result<Self> {
        let frames: Vec<&[i16]> = samples.chunks_exact(FRAME_LENGTH).collect();
        let loud = |frame: &&[i16]| frame_energy(frame) >= ENROLL_GATE;
        let (Some(first), Some(last)) = (
            frames.iter().position(loud),
            frames.iter().rposition(loud),
        ) else {
            return Err(Error::ModelLoad(
                "no speech found in the enrolment recording".to_string(),
            ));
        };
        Self::from_samples(&frames[first..=last].concat(), bands)
    }

    /// Number of template frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the template has no frames
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Per-frame spectral envelope on mel-spaced bands
///
/// Each frame is Hann-windowed and transformed; the magnitude of every band
/// is the root of its summed bin power, and the band vector is L2-normalized
/// so the comparison ignores loudness.
pub struct SpectralEnvelope {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// `bands + 1` bin boundaries
    edges: Vec<usize>,
    scratch: Vec<Complex32>,
}

impl SpectralEnvelope {
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn new(bands: usize) -> Self {
        let bands = bands.max(1);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FRAME_LENGTH);
        let window = (0..FRAME_LENGTH)
            .map(|n| {
                let phase = std::f32::consts::TAU * n as f32 / (FRAME_LENGTH - 1) as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();

        // DC is skipped; the last usable bin is Nyquist
        let nyquist_bin = FRAME_LENGTH / 2;
        let bin_hz = SAMPLE_RATE as f32 / FRAME_LENGTH as f32;
        let top_mel = hz_to_mel(SAMPLE_RATE as f32 / 2.0);
        let mut edges = Vec::with_capacity(bands + 1);
        for i in 0..=bands {
            let hz = mel_to_hz(top_mel * i as f32 / bands as f32);
            let bin = ((hz / bin_hz).round() as usize).clamp(1, nyquist_bin + 1);
            let floor = edges.last().map_or(1, |prev: &usize| prev + 1);
            edges.push(bin.max(floor));
        }
        if let Some(last) = edges.last_mut() {
            *last = (*last).max(nyquist_bin + 1);
        }

        Self {
            fft,
            window,
            edges,
            scratch: vec![Complex32::new(0.0, 0.0); FRAME_LENGTH],
        }
    }

    /// Number of bands produced per frame
    #[must_use]
    pub fn bands(&self) -> usize {
        self.edges.len() - 1
    }

    /// Normalized band magnitudes of one frame; silence gives all zeros
    pub fn analyze(&mut self, frame: &[i16]) -> Vec<f32> {
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = frame.get(i).map_or(0.0, |&s| f32::from(s) / 32768.0);
            *slot = Complex32::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let mut envelope: Vec<f32> = self
            .edges
            .windows(2)
            .map(|edge| {
                self.scratch
                    .get(edge[0]..edge[1].min(FRAME_LENGTH / 2 + 1))
                    .map_or(0.0, |bins| bins.iter().map(Complex32::norm_sqr).sum::<f32>().sqrt())
            })
            .collect();

        let norm = envelope.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut envelope {
                *v /= norm;
            }
        }
        envelope
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Built-in engine: energy gate followed by template matching
pub struct EnergyKeywordEngine {
    model: KeywordModel,
    analyzer: SpectralEnvelope,
    threshold: f32,
    energy_gate: f32,
    window: Vec<Vec<f32>>,
    refractory: usize,
}

impl EnergyKeywordEngine {
    /// Create an engine; higher sensitivity lowers both thresholds
    #[must_use]
    pub fn new(model: KeywordModel, sensitivity: f32) -> Self {
        let sensitivity = sensitivity.clamp(0.0, 1.0);
        Self {
            analyzer: SpectralEnvelope::new(model.bands),
            model,
            threshold: 0.97 - 0.17 * sensitivity,
            energy_gate: 0.04 - 0.03 * sensitivity,
            window: Vec::new(),
            refractory: 0,
        }
    }

    /// Similarity threshold in use
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    #[allow(clippy::cast_precision_loss)]
    fn score(&self) -> f32 {
        let total: f32 = self
            .window
            .iter()
            .zip(&self.model.frames)
            .map(|(seen, expected)| cosine(seen, expected))
            .sum();
        total / self.model.len() as f32
    }
}

impl KeywordEngine for EnergyKeywordEngine {
    fn frame_length(&self) -> usize {
        FRAME_LENGTH
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn process(&mut self, frame: &[i16]) -> Result<bool> {
        if frame.len() != FRAME_LENGTH {
            return Err(Error::Audio(format!(
                "expected {FRAME_LENGTH} samples per frame, got {}",
                frame.len()
            )));
        }

        if self.refractory > 0 {
            self.refractory -= 1;
            return Ok(false);
        }

        if frame_energy(frame) < self.energy_gate {
            self.window.clear();
            return Ok(false);
        }

        let envelope = self.analyzer.analyze(frame);
        self.window.push(envelope);
        if self.window.len() > self.model.len() {
            self.window.remove(0);
        }
        if self.window.len() < self.model.len() {
            return Ok(false);
        }

        let score = self.score();
        tracing::trace!(score, threshold = self.threshold, "keyword score");
        if score >= self.threshold {
            self.window.clear();
            self.refractory = REFRACTORY_FRAMES;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Factory for [`EnergyKeywordEngine`]
///
/// The built-in engine runs fully offline, so the credential is only checked
/// for presence.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnergyKeywordEngineFactory;

impl KeywordEngineFactory for EnergyKeywordEngineFactory {
    fn create(
        &self,
        credential: &SecretString,
        model: &[u8],
        sensitivity: f32,
    ) -> Result<Box<dyn KeywordEngine>> {
        if credential.expose_secret().trim().is_empty() {
            return Err(Error::Credential("access key is empty".to_string()));
        }
        let model = KeywordModel::parse(model)?;
        Ok(Box::new(EnergyKeywordEngine::new(model, sensitivity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(frames: usize, period: usize, amplitude: i16) -> Vec<i16> {
        (0..frames * FRAME_LENGTH)
            .map(|i| if (i / period) % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn tone(frames: usize, period: usize) -> Vec<i16> {
        square(frames, period, 12_000)
    }

    fn hits(engine: &mut EnergyKeywordEngine, audio: &[i16]) -> usize {
        audio
            .chunks_exact(FRAME_LENGTH)
            .map(|frame| usize::from(engine.process(frame).unwrap()))
            .sum()
    }

    #[test]
    fn model_roundtrip_and_padding() {
        let model = KeywordModel::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let bytes = model.to_bytes().unwrap();
        assert_eq!(bytes.len(), MIN_MODEL_BYTES);
        assert_eq!(KeywordModel::parse(&bytes).unwrap(), model);
    }

    #[test]
    fn small_model_is_rejected() {
        let err = KeywordModel::parse(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let err = KeywordModel::parse(&[7u8; MIN_MODEL_BYTES]).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(m) if m.contains("not a keyword model")));
    }

    #[test]
    fn empty_credential_is_rejected() {
        let bytes = KeywordModel::new(vec![vec![1.0]]).unwrap().to_bytes().unwrap();
        let result = EnergyKeywordEngineFactory.create(&SecretString::from(""), &bytes, 0.5);
        assert!(matches!(result, Err(Error::Credential(_))));
    }

    #[test]
    fn engine_spots_template_once() {
        let phrase = tone(4, 7);
        let model = KeywordModel::from_samples(&phrase, 8).unwrap();
        let mut engine = EnergyKeywordEngine::new(model, 0.5);

        let hits: usize = phrase
            .chunks_exact(FRAME_LENGTH)
            .chain(phrase.chunks_exact(FRAME_LENGTH))
            .map(|frame| usize::from(engine.process(frame).unwrap()))
            .sum();

        // The repeat falls inside the refractory window
        assert_eq!(hits, 1);
    }

    #[test]
    fn silence_never_triggers() {
        let model = KeywordModel::from_samples(&tone(3, 5), 8).unwrap();
        let mut engine = EnergyKeywordEngine::new(model, 1.0);
        for _ in 0..20 {
            assert!(!engine.process(&[0; FRAME_LENGTH]).unwrap());
        }
    }

    #[test]
    fn different_sound_does_not_match() {
        let model = KeywordModel::from_samples(&square(4, 7, 12_000), 8).unwrap();
        let mut engine = EnergyKeywordEngine::new(model, 0.5);

        // ~40 Hz against a ~1.1 kHz template, well above the energy gate
        assert_eq!(hits(&mut engine, &square(40, 200, 3_000)), 0);
        assert_eq!(hits(&mut engine, &square(40, 3, 8_000)), 0);
    }

    #[test]
    fn envelope_ignores_loudness() {
        let mut analyzer = SpectralEnvelope::new(8);
        assert_eq!(analyzer.bands(), 8);
        let loud = analyzer.analyze(&square(1, 7, 12_000));
        let quiet = analyzer.analyze(&square(1, 7, 1_200));
        assert!(cosine(&loud, &quiet) > 0.999);
        assert!(analyzer.analyze(&[0; FRAME_LENGTH]).iter().all(|v| v.abs() < f32::EPSILON));
    }

    #[test]
    fn many_bands_stay_inside_the_spectrum() {
        let mut analyzer = SpectralEnvelope::new(300);
        let envelope = analyzer.analyze(&tone(1, 7));
        assert_eq!(envelope.len(), 300);
        assert!(envelope.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn enrolment_trims_surrounding_silence() {
        let mut recording = vec![0i16; 5 * FRAME_LENGTH];
        recording.extend(tone(3, 7));
        recording.extend(vec![40i16; 6 * FRAME_LENGTH]);

        let model = KeywordModel::from_recording(&recording, DEFAULT_BANDS).unwrap();
        assert_eq!(model.len(), 3);

        let mut engine = EnergyKeywordEngine::new(model, 0.5);
        assert_eq!(hits(&mut engine, &recording), 1);
    }

    #[test]
    fn silent_enrolment_is_rejected() {
        let err = KeywordModel::from_recording(&[0; 8 * FRAME_LENGTH], DEFAULT_BANDS).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn wrong_frame_size_is_an_error() {
        let model = KeywordModel::new(vec![vec![1.0]]).unwrap();
        let mut engine = EnergyKeywordEngine::new(model, 0.5);
        assert!(engine.process(&[0; 10]).is_err());
    }
}
