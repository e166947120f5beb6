use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use story_voice_gateway::api::ApiServerBuilder;
use story_voice_gateway::db::{self, SqliteSessionStore, SqliteTranscriptStore};
use story_voice_gateway::session::{SessionRegistry, SessionServices};
use story_voice_gateway::voice::{VadConfig, VadEngine, VadEvent, audio};
use story_voice_gateway::{Config, ContentFilter, FilterContext};

/// Storyvoice - real-time voice sessions for interactive storytelling
#[derive(Parser)]
#[command(name = "storyvoice", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "STORYVOICE_PORT", global = true)]
    port: Option<u16>,

    /// Path to a config file (default: ~/.config/storyvoice/config.toml)
    #[arg(short, long, env = "STORYVOICE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and WebSocket server (default)
    Serve,
    /// Calibrate on the first second of a 16 kHz mono WAV and print speech events
    TestVad {
        /// Path to the WAV file
        wav: PathBuf,
        /// VAD aggressiveness (0-3)
        #[arg(short, long, default_value = "2")]
        aggressiveness: u8,
    },
    /// Print the content filter verdict for a text as JSON
    CheckText {
        /// Text to check
        text: String,
        /// Title of the active story
        #[arg(long)]
        story_title: Option<String>,
        /// Extra story keyword (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,story_voice_gateway=info",
        1 => "info,story_voice_gateway=debug",
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
    match cli.command {
        Some(Command::TestVad {
            wav,
            aggressiveness,
        }) => test_vad(&wav, aggressiveness),
        Some(Command::CheckText {
            text,
            story_title,
            keywords,
        }) => check_text(&text, story_title, keywords),
        Some(Command::Serve) | None => serve(cli.config.as_deref(), cli.port).await,
    }
}

async fn serve(config_path: Option<&Path>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    tracing::debug!(?config, "loaded configuration");

    let pool = db::init(config.db_path())?;
    let services = SessionServices {
        store: Arc::new(SqliteSessionStore::new(pool.clone())),
        transcripts: Arc::new(SqliteTranscriptStore::new(pool.clone())),
        stt: config.stt_backend()?,
        llm: config.llm_backend(),
        recorder: config.audio_sink(),
        config: config.session_config(),
    };
    let registry = Arc::new(SessionRegistry::new(services));

    tracing::info!(
        port = config.server.port,
        data_dir = %config.storage.data_dir.display(),
        record_audio = config.storage.record_audio,
        "starting story voice gateway"
    );

    let server = ApiServerBuilder::new(pool, registry)
        .port(config.server.port)
        .api_key(config.server.api_key.clone())
        .jwt_secret(config.gateway.jwt_secret.clone())
        .rate_limit_per_minute(config.server.rate_limit_per_minute)
        .idle_timeout(config.gateway.idle_timeout)
        .orphan_ttl(config.gateway.orphan_ttl)
        .build();

    server.run(shutdown_signal()).await?;
    tracing::info!("story voice gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested, draining sessions");
}

/// Run the VAD over a WAV file
fn test_vad(path: &Path, aggressiveness: u8) -> anyhow::Result<()> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 {
        anyhow::bail!("expected 16-bit mono audio, got {} channel(s) at {} bits", spec.channels, spec.bits_per_sample);
    }

    let config = VadConfig {
        sample_rate: spec.sample_rate,
        aggressiveness,
        ..VadConfig::default()
    };
    let frame_ms = config.frame_duration_ms;
    let vad = VadEngine::new(config)?;

    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    let pcm = audio::samples_to_pcm(&samples);
    let frames: Vec<Vec<u8>> = pcm
        .chunks_exact(vad.frame_bytes())
        .map(<[u8]>::to_vec)
        .collect();

    let calibration_frames = (1000 / frame_ms) as usize;
    let (ambient, rest) = frames.split_at(calibration_frames.min(frames.len()));
    let calibration = vad.calibrate(ambient);
    vad.set_noise_floor(calibration.noise_floor_db);

    println!(
        "Calibrated on {} frames: noise floor {:.1} dB, p90 {:.1} dB",
        calibration.sample_count, calibration.noise_floor_db, calibration.percentile_90_db
    );
    println!("---");

    for (i, frame) in rest.iter().enumerate() {
        let at_ms = (calibration_frames + i) as u64 * u64::from(frame_ms);
        match vad.process_frame(frame)? {
            Some(VadEvent::SpeechStarted { .. }) => println!("[{at_ms:>7} ms] speech started"),
            Some(VadEvent::SpeechEnded { duration_ms }) => {
                println!("[{at_ms:>7} ms] speech ended ({duration_ms} ms)");
            }
            None => {}
        }
    }

    Ok(())
}

/// Print the filter verdict for `text`
fn check_text(text: &str, story_title: Option<String>, keywords: Vec<String>) -> anyhow::Result<()> {
    let context = (story_title.is_some() || !keywords.is_empty())
        .then(|| FilterContext::new(story_title.unwrap_or_default(), keywords));

    let result = ContentFilter::new().filter(text, context.as_ref());
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
