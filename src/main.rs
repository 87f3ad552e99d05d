use std::path::PathBuf;

use clap::Parser;

use voxtream::config::{AppConfig, DataDirs};
use voxtream::server::Broadcaster;
use voxtream::{download, logging, server, Engine};

#[derive(Parser)]
#[command(name = "voxtream")]
#[command(about = "Real-time speech-to-text and translation streaming engine")]
#[command(version)]
struct Args {
    /// Path to a JSON config file (default: <data dir>/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen host override
    #[arg(long)]
    host: Option<String>,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,

    /// Transcribe a WAV file instead of the microphone
    #[arg(long)]
    wav: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let dirs = DataDirs::resolve()?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| dirs.data_dir.join("config.json"));
    let mut config = AppConfig::load(Some(&config_path));

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(wav) = args.wav {
        config.audio.source = "wav".to_string();
        config.audio.wav_path = Some(wav);
    }

    logging::init(&config.logging.level, &dirs.logs_dir)?;
    tracing::info!("Data directory: {:?}", dirs.data_dir);

    // The VAD model is small; fetch it up front so pipeline starts are fast
    if config.vad.enabled {
        if let Err(e) = download::init_silero_model(&dirs.models_dir).await {
            tracing::warn!("VAD model unavailable: {}. Gate will run fail-open.", e);
        }
    }

    let broadcaster = Broadcaster::new();
    let engine = Engine::new(config.clone(), dirs, broadcaster.clone());

    let host = config.server.host.clone();
    let port = config.server.port;

    tokio::select! {
        result = server::run(engine.clone(), broadcaster, &host, port) => {
            if let Err(e) = result {
                tracing::error!("Server terminated: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    engine.handle_stop().await;
    tracing::info!("Engine shut down");
    Ok(())
}
