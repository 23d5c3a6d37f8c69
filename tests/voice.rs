//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

mod common;

use std::io::Cursor;
use std::sync::Arc;

use benji_voice::Error;
use benji_voice::voice::{
    DetectorEvent, EnergyKeywordEngineFactory, FrameSource, KeywordModel, ModelSource, SAMPLE_RATE,
    WakeWordDetector, WakeWordStatus, frame_energy, samples_to_wav,
};
use common::FakeFrameSource;
use secrecy::SecretString;
use tokio::sync::mpsc;

const FRAME: usize = 512;

/// Square wave standing in for a spoken phrase
fn phrase(frames: usize, period: usize) -> Vec<i16> {
    (0..frames * FRAME)
        .map(|i| if (i / period) % 2 == 0 { 10_000 } else { -10_000 })
        .collect()
}

/// Generate sine wave audio samples
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn sine(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<i16> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin() * 32767.0) as i16
        })
        .collect()
}

fn write_model(samples: &[i16]) -> tempfile::NamedTempFile {
    let model = KeywordModel::from_samples(samples, 8).unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), model.to_bytes().unwrap()).unwrap();
    file
}

async fn ready_detector(
    model: &tempfile::NamedTempFile,
) -> (
    WakeWordDetector,
    Arc<FakeFrameSource>,
    mpsc::UnboundedReceiver<DetectorEvent>,
) {
    let source = Arc::new(FakeFrameSource::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let mut detector = WakeWordDetector::new(
        Arc::new(EnergyKeywordEngineFactory),
        Arc::clone(&source) as Arc<dyn FrameSource>,
        tx,
    );
    detector
        .initialize(
            reqwest::Client::new(),
            SecretString::from("local-key"),
            ModelSource::parse(&model.path().display().to_string()).unwrap(),
            0.5,
        )
        .await
        .unwrap();
    (detector, source, rx)
}

#[tokio::test]
async fn compiled_model_spots_the_phrase() {
    let samples = phrase(4, 9);
    let model = write_model(&samples);
    let (mut detector, source, mut rx) = ready_detector(&model).await;
    assert_eq!(detector.status(), WakeWordStatus::Ready);

    detector.start().unwrap();
    for _ in 0..3 {
        source.push(&[0; FRAME]);
    }
    for frame in samples.chunks_exact(FRAME) {
        source.push(frame);
    }

    let event = rx.recv().await.unwrap();
    assert!(matches!(event, DetectorEvent::Detected { .. }));
    assert!(detector.is_current(&event));
}

#[tokio::test]
async fn silence_does_not_wake() {
    let model = write_model(&phrase(4, 9));
    let (mut detector, source, mut rx) = ready_detector(&model).await;

    detector.start().unwrap();
    for _ in 0..10 {
        source.push(&[0; FRAME]);
    }
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn a_different_sound_does_not_wake() {
    let model = write_model(&phrase(4, 9));
    let (mut detector, source, mut rx) = ready_detector(&model).await;

    detector.start().unwrap();
    for frame in phrase(12, 150).chunks_exact(FRAME) {
        source.push(frame);
    }
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn empty_access_key_is_a_credential_error() {
    let model = write_model(&phrase(2, 5));
    let source = Arc::new(FakeFrameSource::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut detector = WakeWordDetector::new(Arc::new(EnergyKeywordEngineFactory), source, tx);

    let err = detector
        .initialize(
            reqwest::Client::new(),
            SecretString::from(""),
            ModelSource::parse(&model.path().display().to_string()).unwrap(),
            0.5,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Credential(_)));
    assert!(err.is_wake_word_only());
    assert_eq!(detector.status(), WakeWordStatus::Failed);
}

#[tokio::test]
async fn truncated_model_is_a_model_load_error() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"BNJW").unwrap();

    let source = Arc::new(FakeFrameSource::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut detector = WakeWordDetector::new(Arc::new(EnergyKeywordEngineFactory), source, tx);

    let err = detector
        .initialize(
            reqwest::Client::new(),
            SecretString::from("local-key"),
            ModelSource::File(file.path().to_path_buf()),
            0.5,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModelLoad(_)));
}

#[test]
fn wav_roundtrip() {
    let original = sine(440.0, 0.1, 0.5);
    let wav = samples_to_wav(&original, SAMPLE_RATE).unwrap();

    let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(read, original);
}

#[test]
fn speech_is_louder_than_silence() {
    let speech = sine(440.0, 0.1, 0.3);
    assert!(frame_energy(&speech) > 0.1);
    assert!(frame_energy(&vec![0; speech.len()]) < 0.001);
}
