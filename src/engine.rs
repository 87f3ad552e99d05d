//! Engine supervisor
//!
//! Owns the one active pipeline. `start` merges the client config over the
//! base config, loads the models, and spins the workers up; `stop` tears them
//! down. A second `start` stops the previous pipeline first.

use std::sync::Arc;

use serde_json::Value;

use crate::asr_engine::AsrEngine;
use crate::audio_source::{AudioSource, MicrophoneSource, WavFileSource};
use crate::config::{AppConfig, DataDirs};
use crate::error::{EngineError, Result};
use crate::pipeline::Pipeline;
use crate::server::Broadcaster;
use crate::translation::TranslationRouter;
use crate::vad_gate::VadGate;

pub struct Engine {
    base_config: AppConfig,
    dirs: DataDirs,
    broadcaster: Broadcaster,
    active: tokio::sync::Mutex<Option<Pipeline>>,
}

impl Engine {
    pub fn new(base_config: AppConfig, dirs: DataDirs, broadcaster: Broadcaster) -> Arc<Self> {
        Arc::new(Self {
            base_config,
            dirs,
            broadcaster,
            active: tokio::sync::Mutex::new(None),
        })
    }

    /// Start a pipeline from the base config overlaid with the client's
    /// `start` config. Config and ASR model-load errors refuse the start;
    /// translation load failures only disable translation.
    pub async fn handle_start(&self, client_config: Value) -> Result<()> {
        let mut guard = self.active.lock().await;

        // Only one pipeline at a time
        if let Some(previous) = guard.take() {
            tracing::info!("Stopping previous pipeline before new start");
            previous.stop().await;
        }

        let mut config = self.base_config.clone();
        config.apply_patch(&client_config)?;

        let dirs = self.dirs.clone();
        let blocking_config = config.clone();
        let components = tokio::task::spawn_blocking(move || {
            build_components(&blocking_config, &dirs)
        })
        .await
        .map_err(|e| EngineError::ModelLoad(format!("component setup panicked: {}", e)))??;
        let (vad, asr, router) = components;

        let source = build_source(&config)?;
        let pipeline = Pipeline::start(
            &config,
            source,
            vad,
            asr,
            router,
            self.broadcaster.clone(),
        )?;

        *guard = Some(pipeline);
        tracing::info!("Pipeline running");
        Ok(())
    }

    /// Stop and tear down the active pipeline, if any
    pub async fn handle_stop(&self) {
        let pipeline = self.active.lock().await.take();
        match pipeline {
            Some(pipeline) => pipeline.stop().await,
            None => tracing::debug!("Stop requested with no active pipeline"),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|p| p.is_running())
            .unwrap_or(false)
    }
}

type Components = (VadGate, AsrEngine, Option<TranslationRouter>);

/// Model loading happens off the async runtime: the native loads block for
/// seconds.
fn build_components(config: &AppConfig, dirs: &DataDirs) -> Result<Components> {
    let vad_model_path = dirs.models_dir.join("silero_vad.onnx");
    let vad = VadGate::new(&config.vad, &vad_model_path, config.audio.sample_rate);

    let mut asr = AsrEngine::new(config.audio.sample_rate);
    asr.load_model(&config.asr, &dirs.models_dir)?;

    let router = if config.translation.enabled {
        let mut router = TranslationRouter::new();
        match router.load_model(&config.translation, config.asr.device, &dirs.models_dir) {
            Ok(()) => Some(router),
            Err(e) => {
                tracing::warn!("Translation disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    Ok((vad, asr, router))
}

fn build_source(config: &AppConfig) -> Result<Box<dyn AudioSource>> {
    match config.audio.source.as_str() {
        "wav" => {
            let path = config.audio.wav_path.as_ref().ok_or_else(|| {
                EngineError::Config("audio.wav_path is required for the wav source".to_string())
            })?;
            Ok(Box::new(WavFileSource::new(
                path.clone(),
                config.audio.sample_rate as u32,
                config.audio.chunk_ms,
                true,
            )))
        }
        "microphone" => Ok(Box::new(MicrophoneSource::new(
            config.audio.device.clone(),
            config.audio.sample_rate as u32,
            config.audio.chunk_ms,
        ))),
        other => Err(EngineError::Config(format!(
            "unknown audio source: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_source_requires_path() {
        let mut config = AppConfig::default();
        config.audio.source = "wav".to_string();
        assert!(matches!(
            build_source(&config).unwrap_err(),
            EngineError::Config(_)
        ));
    }

    #[test]
    fn unknown_source_rejected() {
        let mut config = AppConfig::default();
        config.audio.source = "cassette".to_string();
        assert!(matches!(
            build_source(&config).unwrap_err(),
            EngineError::Config(_)
        ));
    }
}
