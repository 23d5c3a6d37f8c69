use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use benji_voice::voice::{
    AudioPlayback, AudioSessionManager, CpalMicrophone, CpalPlatform, DEFAULT_BANDS, FRAME_LENGTH,
    FrameSource, KeywordModel, ModelSource, SAMPLE_RATE, TextToSpeech, frame_energy,
};
use benji_voice::{Config, Daemon};

/// Benji - hands-free voice front-end for the calendar assistant
#[derive(Parser)]
#[command(name = "benji", version, about)]
struct Cli {
    /// Bridge port
    #[arg(long, env = "BENJI_BRIDGE_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Print environment capabilities and microphone permission
    Diagnose,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Bonjour ! Ceci est un test de la synthèse vocale.")]
        text: String,
    },
    /// Record the wake phrase and write the keyword model
    Enroll {
        /// Recording length in seconds
        #[arg(short, long, default_value = "3")]
        duration: u64,
    },
    /// Run the background bridge only
    Bridge,
    /// Send a wake to a running daemon through its bridge
    SimulateWake,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,benji_voice=info",
        1 => "info,benji_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.bridge.port = port;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Diagnose => diagnose().await,
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::Enroll { duration } => enroll(&config, duration).await,
            Command::Bridge => Ok(Daemon::new(config).run_bridge().await?),
            Command::SimulateWake => simulate_wake(config.bridge.port).await,
        };
    }

    tracing::info!(
        mode = %config.voice.conversation_mode,
        bridge_port = config.bridge.port,
        "starting benji"
    );
    tracing::debug!(?config, "loaded configuration");

    Daemon::new(config).run().await?;
    Ok(())
}

/// Print the diagnostic snapshot after asking for the microphone
async fn diagnose() -> anyhow::Result<()> {
    let microphone: Arc<dyn FrameSource> = Arc::new(CpalMicrophone);
    let session = AudioSessionManager::new(Arc::new(CpalPlatform::new(microphone)));

    match session.request_microphone_permission().await {
        Ok(permission) => println!("Microphone permission: {permission}"),
        Err(e) => println!("Microphone check failed: {e}"),
    }
    if let Err(e) = session.ensure_audio_context(SAMPLE_RATE).await {
        println!("Audio context unavailable: {e}");
    }

    // Speech recognition rides on the microphone
    let snapshot = session.diagnostics(true);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let missing = snapshot.critical_missing();
    if missing.is_empty() {
        println!("\nAll critical capabilities present.");
    } else {
        println!("\nMissing: {}", missing.join(", "));
        println!("Only manual text input will be available.");
    }

    session.close().await;
    Ok(())
}

/// Show microphone levels once per second
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Listening for {duration}s at {SAMPLE_RATE} Hz, say something.\n");

    let mut frames = CpalMicrophone.open(SAMPLE_RATE, 1600)?;
    let mut loudest = 0.0f32;

    for second in 1..=duration {
        let until = Instant::now() + Duration::from_secs(1);
        let (mut energy, mut peak) = (0.0f32, 0i16);

        while Instant::now() < until {
            let Some(frame) = frames.next_frame().await else {
                anyhow::bail!("microphone stream closed");
            };
            energy = energy.max(frame_energy(&frame));
            peak = frame.iter().fold(peak, |p, s| p.max(s.saturating_abs()));
        }
        loudest = loudest.max(energy);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bars = (energy * 100.0).min(40.0) as usize;
        println!("{second:>3}s  rms {energy:.4}  peak {peak:>5}  |{:<40}|", "#".repeat(bars));
    }

    if loudest < 0.001 {
        println!("\nNo signal. Check the default input with `pactl info` or `arecord -l`.");
    } else {
        println!("\nMicrophone is delivering audio.");
    }
    Ok(())
}

/// Play a short tone through the default output
async fn test_speaker() -> anyhow::Result<()> {
    const RATE: f32 = 24_000.0;
    const TONE_HZ: f32 = 440.0;

    println!("Playing a 2s tone at {TONE_HZ} Hz...");

    #[allow(clippy::cast_precision_loss)]
    let tone: Vec<f32> = (0..48_000)
        .map(|n| (std::f32::consts::TAU * TONE_HZ * n as f32 / RATE).sin() * 0.3)
        .collect();
    AudioPlayback::new()?.play_samples(tone).await?;

    println!("Done. Silence means the default sink is wrong (`pactl list sinks short`).");
    Ok(())
}

/// Synthesize `text` and play it back
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    let Some(key) = config.api_keys.openai.clone() else {
        anyhow::bail!("OPENAI_API_KEY is required for speech synthesis");
    };

    let tts = TextToSpeech::new(
        key,
        config.assistant.base_url.clone(),
        config.voice.tts_model.clone(),
        config.voice.tts_voice.clone(),
        config.voice.tts_speed,
    )?;

    println!("Synthesizing \"{text}\" with voice {}", config.voice.tts_voice);
    let mp3 = tts.synthesize(text).await?;
    println!("{} bytes received, playing", mp3.len());
    AudioPlayback::new()?.play_mp3(mp3).await?;
    Ok(())
}

/// Record the wake phrase once and compile it to the configured model path
async fn enroll(config: &Config, duration: u64) -> anyhow::Result<()> {
    let ModelSource::File(path) = ModelSource::parse(&config.wake_word.model_path)? else {
        anyhow::bail!("model path is a URL; point BENJI_MODEL_PATH at a file to enroll");
    };

    let mut frames = CpalMicrophone.open(SAMPLE_RATE, FRAME_LENGTH)?;
    println!("Say the wake phrase once in the next {duration}s...");

    let until = Instant::now() + Duration::from_secs(duration);
    let mut recording = Vec::new();
    while Instant::now() < until {
        let Some(frame) = frames.next_frame().await else {
            anyhow::bail!("microphone stream closed");
        };
        recording.extend(frame);
    }
    drop(frames);

    let model = KeywordModel::from_recording(&recording, DEFAULT_BANDS)?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&path, model.to_bytes()?).await?;

    tracing::info!(path = %path.display(), frames = model.len(), "keyword model enrolled");
    println!("Wrote {} ({} frames)", path.display(), model.len());
    Ok(())
}

/// Ask a running daemon's bridge to relay a wake
async fn simulate_wake(port: u16) -> anyhow::Result<()> {
    let url = format!("http://127.0.0.1:{port}/wake");
    let response = reqwest::Client::new().post(&url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("bridge answered {}", response.status());
    }
    println!("Wake relayed through {url}");
    Ok(())
}
