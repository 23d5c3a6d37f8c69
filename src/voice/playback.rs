//! Audio playback to speakers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Plays audio to the default output device
#[derive(Debug, Clone)]
pub struct AudioPlayback {
    config: StreamConfig,
}

impl AudioPlayback {
    /// Check the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no usable output device exists
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let rate_fits = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| rate_fits(c, 1))
            .or_else(|| {
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| rate_fits(c, 2))
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }

    /// Decode MP3 bytes and play them; resolves when playback has finished
    ///
    /// # Errors
    ///
    /// Returns error if decoding or playback fails
    pub async fn play_mp3(&self, mp3_data: Vec<u8>) -> Result<()> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let samples = decode_mp3(&mp3_data)?;
            play_blocking(&config, samples)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }

    /// Play raw f32 samples at the playback rate
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    pub async fn play_samples(&self, samples: Vec<f32>) -> Result<()> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || play_blocking(&config, samples))
            .await
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

/// Read position shared with the output callback
struct Cursor {
    samples: Vec<f32>,
    next: AtomicUsize,
    drained: AtomicBool,
}

impl Cursor {
    /// Next sample, or silence once the clip is exhausted
    fn advance(&self) -> f32 {
        let at = self.next.fetch_add(1, Ordering::Relaxed);
        self.samples.get(at).copied().unwrap_or_else(|| {
            self.drained.store(true, Ordering::Release);
            0.0
        })
    }
}

/// Play samples on the current thread until done
fn play_blocking(config: &StreamConfig, samples: Vec<f32>) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("output device disappeared".to_string()))?;

    let channels = usize::from(config.channels);
    let clip_ms = samples.len() as u64 * 1000 / u64::from(PLAYBACK_SAMPLE_RATE);
    let cursor = Arc::new(Cursor {
        samples,
        next: AtomicUsize::new(0),
        drained: AtomicBool::new(false),
    });

    let feed = Arc::clone(&cursor);
    let stream = device
        .build_output_stream(
            config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in out.chunks_mut(channels) {
                    frame.fill(feed.advance());
                }
            },
            |err| tracing::error!(error = %err, "output stream error"),
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;
    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let deadline = std::time::Instant::now() + Duration::from_millis(clip_ms + 500);
    while !cursor.drained.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    // Device buffer tail
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    tracing::debug!(clip_ms, "clip played");
    Ok(())
}

fn pcm_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(std::io::Cursor::new(mp3_data));
    let mut mono = Vec::new();

    loop {
        let frame = match decoder.next_frame() {
            Ok(frame) => frame,
            Err(minimp3::Error::Eof) => return Ok(mono),
            Err(e) => return Err(Error::Audio(format!("mp3 decoding failed: {e}"))),
        };
        let width = frame.channels.max(1);
        // Downmix every channel group to its average
        mono.extend(frame.data.chunks(width).map(|group| {
            #[allow(clippy::cast_precision_loss)]
            let count = group.len() as f32;
            group.iter().copied().map(pcm_to_f32).sum::<f32>() / count
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mp3_decodes_to_nothing() {
        assert!(decode_mp3(&[]).unwrap().is_empty());
    }

    #[test]
    fn cursor_pads_with_silence_and_flags_the_end() {
        let cursor = Cursor {
            samples: vec![0.5, -0.5],
            next: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
        };
        assert!((cursor.advance() - 0.5).abs() < f32::EPSILON);
        assert!((cursor.advance() + 0.5).abs() < f32::EPSILON);
        assert!(!cursor.drained.load(Ordering::Acquire));
        assert!(cursor.advance().abs() < f32::EPSILON);
        assert!(cursor.drained.load(Ordering::Acquire));
    }
}
