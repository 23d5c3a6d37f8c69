//! Cloud-backed speech recognizer
//!
//! Segments microphone audio by energy and sends each utterance to a
//! [`Transcriber`]. Each utterance becomes one final segment.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture_session::{
    RecognitionErrorKind, RecognitionSegment, RecognizerEvent, RecognizerMessage,
    SpeechRecognizer,
};
use super::microphone::{FrameSource, SAMPLE_RATE, frame_energy, samples_to_wav};
use super::stt::Transcriber;
use crate::Result;

/// Samples per microphone frame (100 ms)
const FRAME_LENGTH: usize = 1600;

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to keep an utterance (0.3 seconds)
const MIN_SPEECH_SAMPLES: usize = 4800;

/// Silence duration that ends an utterance (0.5 seconds)
const SILENCE_SAMPLES: usize = 8000;

/// Silence before a run gives up with `NoSpeech` (8 seconds)
const NO_SPEECH_SAMPLES: usize = SAMPLE_RATE as usize * 8;

/// What one frame did to the segmenter
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Quiet,
    SpeechStarted,
    Speaking,
    Utterance(Vec<i16>),
}

/// Energy-based utterance segmentation
#[derive(Debug, Default)]
struct Segmenter {
    buffer: Vec<i16>,
    silence: usize,
    in_speech: bool,
}

impl Segmenter {
    fn push(&mut self, frame: &[i16]) -> Step {
        let is_speech = frame_energy(frame) > ENERGY_THRESHOLD;

        if !self.in_speech {
            if !is_speech {
                return Step::Quiet;
            }
            self.in_speech = true;
            self.silence = 0;
            self.buffer.clear();
            self.buffer.extend_from_slice(frame);
            tracing::trace!("speech detected");
            return Step::SpeechStarted;
        }

        self.buffer.extend_from_slice(frame);
        if is_speech {
            self.silence = 0;
        } else {
            self.silence += frame.len();
        }

        if self.silence > SILENCE_SAMPLES {
            self.in_speech = false;
            let samples = std::mem::take(&mut self.buffer);
            if samples.len() > MIN_SPEECH_SAMPLES + self.silence {
                tracing::debug!(samples = samples.len(), "utterance complete");
                return Step::Utterance(samples);
            }
            // Too short to be speech, likely a click
            return Step::Quiet;
        }

        Step::Speaking
    }
}

/// Recognizer combining the microphone and a cloud transcriber
pub struct CloudRecognizer {
    source: Arc<dyn FrameSource>,
    transcriber: Arc<dyn Transcriber>,
    task: Option<JoinHandle<()>>,
}

impl CloudRecognizer {
    #[must_use]
    pub fn new(source: Arc<dyn FrameSource>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            source,
            transcriber,
            task: None,
        }
    }
}

impl SpeechRecognizer for CloudRecognizer {
    fn start(
        &mut self,
        generation: u64,
        continuous: bool,
        events: mpsc::UnboundedSender<RecognizerMessage>,
    ) -> Result<()> {
        self.stop();

        let mut frames = self.source.open(SAMPLE_RATE, FRAME_LENGTH)?;
        let transcriber = Arc::clone(&self.transcriber);

        self.task = Some(tokio::spawn(async move {
            let send = |event: RecognizerEvent| {
                events
                    .send(RecognizerMessage { generation, event })
                    .is_ok()
            };

            let mut segmenter = Segmenter::default();
            let mut quiet = 0usize;

            loop {
                let Some(frame) = frames.next_frame().await else {
                    send(RecognizerEvent::Error(RecognitionErrorKind::AudioCaptureFailed));
                    return;
                };

                match segmenter.push(&frame) {
                    Step::Quiet => {
                        quiet += frame.len();
                        if quiet >= NO_SPEECH_SAMPLES {
                            send(RecognizerEvent::Error(RecognitionErrorKind::NoSpeech));
                            send(RecognizerEvent::End);
                            return;
                        }
                    }
                    Step::SpeechStarted => {
                        quiet = 0;
                        // Empty interim so a pending commit window restarts
                        let segments = vec![RecognitionSegment::interim("")];
                        if !send(RecognizerEvent::Result { segments }) {
                            return;
                        }
                    }
                    Step::Speaking => {}
                    Step::Utterance(samples) => {
                        quiet = 0;
                        let text = match samples_to_wav(&samples, SAMPLE_RATE) {
                            Ok(wav) => transcriber.transcribe(&wav).await,
                            Err(e) => Err(e),
                        };

                        match text {
                            Ok(text) => {
                                let segments = vec![RecognitionSegment::final_text(text)];
                                if !send(RecognizerEvent::Result { segments }) {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "transcription failed");
                                send(RecognizerEvent::Error(
                                    RecognitionErrorKind::NetworkRequired,
                                ));
                                send(RecognizerEvent::End);
                                return;
                            }
                        }

                        if !continuous {
                            send(RecognizerEvent::End);
                            return;
                        }
                    }
                }
            }
        }));

        tracing::debug!(generation, continuous, "recognizer started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("recognizer stopped");
        }
    }

    fn is_available(&self) -> bool {
        self.source.is_available()
    }
}

impl Drop for CloudRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::Error;
    use crate::voice::microphone::FrameSubscription;

    const LOUD: [i16; FRAME_LENGTH] = [8_000; FRAME_LENGTH];
    const SILENT: [i16; FRAME_LENGTH] = [0; FRAME_LENGTH];

    #[test]
    fn segmenter_splits_on_silence() {
        let mut seg = Segmenter::default();
        assert_eq!(seg.push(&SILENT), Step::Quiet);
        assert_eq!(seg.push(&LOUD), Step::SpeechStarted);
        for _ in 0..5 {
            assert_eq!(seg.push(&LOUD), Step::Speaking);
        }
        let mut utterance = None;
        for _ in 0..6 {
            if let Step::Utterance(samples) = seg.push(&SILENT) {
                utterance = Some(samples);
            }
        }
        let samples = utterance.unwrap();
        assert!(samples.len() > MIN_SPEECH_SAMPLES);
    }

    #[test]
    fn short_blip_is_ignored() {
        let mut seg = Segmenter::default();
        seg.push(&LOUD);
        let steps: Vec<Step> = (0..6).map(|_| seg.push(&SILENT)).collect();
        assert!(!steps.iter().any(|s| matches!(s, Step::Utterance(_))));
    }

    struct OneShotSource(Mutex<Option<mpsc::Receiver<Vec<i16>>>>);

    impl FrameSource for OneShotSource {
        fn open(&self, _: u32, _: usize) -> Result<FrameSubscription> {
            self.0
                .lock()
                .unwrap()
                .take()
                .map(|rx| FrameSubscription::new(rx, None))
                .ok_or_else(|| Error::Audio("device busy".to_string()))
        }
        fn is_available(&self) -> bool {
            true
        }
    }

    struct EchoTranscriber;

    #[async_trait]
    impl Transcriber for EchoTranscriber {
        async fn transcribe(&self, wav: &[u8]) -> Result<String> {
            Ok(format!("{} octets", wav.len()))
        }
    }

    #[tokio::test]
    async fn single_shot_run_emits_final_then_end() {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let source = Arc::new(OneShotSource(Mutex::new(Some(frame_rx))));
        let mut recognizer = CloudRecognizer::new(source, Arc::new(EchoTranscriber));

        let (tx, mut rx) = mpsc::unbounded_channel();
        recognizer.start(7, false, tx).unwrap();

        for _ in 0..6 {
            frame_tx.send(LOUD.to_vec()).await.unwrap();
        }
        for _ in 0..6 {
            frame_tx.send(SILENT.to_vec()).await.unwrap();
        }

        let started = rx.recv().await.unwrap();
        assert_eq!(started.generation, 7);

        let result = rx.recv().await.unwrap();
        assert!(matches!(
            result.event,
            RecognizerEvent::Result { ref segments } if segments[0].is_final
        ));
        assert_eq!(rx.recv().await.unwrap().event, RecognizerEvent::End);
    }

    #[tokio::test]
    async fn busy_microphone_fails_start() {
        let source = Arc::new(OneShotSource(Mutex::new(None)));
        let mut recognizer = CloudRecognizer::new(source, Arc::new(EchoTranscriber));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(recognizer.start(1, true, tx).is_err());
    }
}
