use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

/// URL for the Silero VAD model. Pinned to v4.0: the gate drives the
/// separate-(h, c) recurrent interface of that graph.
const SILERO_VAD_URL: &str =
    "https://github.com/snakers4/silero-vad/raw/v4.0/files/silero_vad.onnx";

/// Cached filename for the Silero VAD model
const SILERO_MODEL_FILENAME: &str = "silero_vad.onnx";

/// Some mirrors reject requests without a browser user agent
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

/// Files that must be present in a converted CT2 Whisper model
const WHISPER_REQUIRED_FILES: [&str; 4] = [
    "model.bin",
    "config.json",
    "tokenizer.json",
    "preprocessor_config.json",
];

/// Files that must be present in a converted CT2 Marian model
const MARIAN_REQUIRED_FILES: [&str; 2] = ["model.bin", "config.json"];

/// Checks if all required model files are present
fn is_model_complete(model_dir: &Path, required: &[&str]) -> bool {
    required.iter().all(|file| model_dir.join(file).exists())
}

/// Checks the Silero model file exists and is not a truncated download
fn is_silero_model_valid(model_path: &Path) -> bool {
    match fs::metadata(model_path) {
        Ok(metadata) => metadata.len() > 10_000,
        Err(_) => false,
    }
}

/// Download a file from a URL into `output_path`, atomically via a temp file
pub async fn download_file(url: &str, output_path: &Path) -> Result<()> {
    tracing::info!("Downloading {}", url);

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = output_path.with_extension("downloading");

    let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("Failed to download {}, status: {}", url, response.status());
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .with_context(|| format!("Failed to create {:?}", temp_path))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_logged = 0u64;

    while let Some(item) = stream.next().await {
        let chunk = item.context("Error while downloading file")?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        // Progress every ~10 MB
        if downloaded - last_logged > 10_000_000 {
            last_logged = downloaded;
            if total_size > 0 {
                tracing::info!(
                    "Downloaded {:.1}% ({}/{} bytes)",
                    downloaded as f64 / total_size as f64 * 100.0,
                    downloaded,
                    total_size
                );
            } else {
                tracing::info!("Downloaded {} bytes", downloaded);
            }
        }
    }

    file.flush().await?;
    drop(file);

    fs::rename(&temp_path, output_path)
        .with_context(|| format!("Failed to move {:?} into place", temp_path))?;

    tracing::info!("Download complete: {:?} ({} bytes)", output_path, downloaded);
    Ok(())
}

/// Download the Silero VAD model into `models/silero_vad.onnx` if missing
pub async fn init_silero_model(models_dir: &Path) -> Result<PathBuf> {
    let model_path = models_dir.join(SILERO_MODEL_FILENAME);

    if is_silero_model_valid(&model_path) {
        tracing::debug!("Silero VAD model present at {:?}", model_path);
        return Ok(model_path);
    }

    download_file(SILERO_VAD_URL, &model_path).await?;

    if !is_silero_model_valid(&model_path) {
        anyhow::bail!("Downloaded Silero model is invalid or corrupted");
    }

    tracing::info!("Silero VAD model ready at {:?}", model_path);
    Ok(model_path)
}

/// Run `ct2-transformers-converter` for a HuggingFace checkpoint
fn convert_model(model_name: &str, output_dir: &Path, quantization: &str, copy_files: &[&str]) -> Result<()> {
    tracing::info!(
        "Converting {} to CTranslate2 {} format at {:?}",
        model_name,
        quantization,
        output_dir
    );

    if let Some(parent) = output_dir.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut command = Command::new("ct2-transformers-converter");
    command
        .arg("--force")
        .arg("--model")
        .arg(model_name)
        .arg("--quantization")
        .arg(quantization)
        .arg("--output_dir")
        .arg(output_dir);
    if !copy_files.is_empty() {
        command.arg("--copy_files").args(copy_files);
    }

    let status = command
        .status()
        .context("Failed to run ct2-transformers-converter (is it installed?)")?;

    if !status.success() {
        // Leave no partial model behind: a half-written directory would pass
        // the exists() check on the next run.
        if output_dir.exists() {
            let _ = fs::remove_dir_all(output_dir);
        }
        anyhow::bail!("Model conversion failed with status: {}", status);
    }

    tracing::info!("Conversion of {} complete", model_name);
    Ok(())
}

/// Resolve (converting if necessary) a CT2 Whisper model directory for the
/// given checkpoint name, cached as `models/<name>-ct2/`.
pub fn ensure_whisper_model(models_dir: &Path, model_name: &str) -> Result<PathBuf> {
    let simple_name = model_name.split('/').next_back().unwrap_or(model_name);
    let model_dir = models_dir.join(format!("{}-ct2", simple_name));

    if is_model_complete(&model_dir, &WHISPER_REQUIRED_FILES) {
        tracing::debug!("Converted Whisper model present at {:?}", model_dir);
        return Ok(model_dir);
    }

    convert_model(
        model_name,
        &model_dir,
        "int8",
        &["preprocessor_config.json", "tokenizer.json"],
    )?;

    if !is_model_complete(&model_dir, &WHISPER_REQUIRED_FILES) {
        anyhow::bail!("Whisper model conversion incomplete at {:?}", model_dir);
    }
    Ok(model_dir)
}

/// Resolve (converting if necessary) a CT2 Marian model directory, cached as
/// `models/ct2/<safe_name>/` where `safe_name` replaces `/` with `_`.
pub fn ensure_marian_model(models_dir: &Path, model_name: &str) -> Result<PathBuf> {
    let safe_name = model_name.replace('/', "_");
    let model_dir = models_dir.join("ct2").join(safe_name);

    if is_model_complete(&model_dir, &MARIAN_REQUIRED_FILES) {
        tracing::debug!("Converted Marian model present at {:?}", model_dir);
        return Ok(model_dir);
    }

    convert_model(model_name, &model_dir, "int8", &[])?;

    if !is_model_complete(&model_dir, &MARIAN_REQUIRED_FILES) {
        anyhow::bail!("Marian model conversion incomplete at {:?}", model_dir);
    }
    Ok(model_dir)
}

/// Map a model size to the default Whisper checkpoint to convert
pub fn whisper_checkpoint_for(model_size: crate::config::ModelSize) -> &'static str {
    use crate::config::ModelSize;
    match model_size {
        ModelSize::Tiny => "openai/whisper-tiny",
        ModelSize::Base => "openai/whisper-base",
        ModelSize::Small => "openai/whisper-small",
        ModelSize::Medium => "openai/whisper-medium",
        ModelSize::Large => "openai/whisper-large-v3",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_completeness_check() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_model_complete(dir.path(), &MARIAN_REQUIRED_FILES));

        fs::write(dir.path().join("model.bin"), b"x").unwrap();
        assert!(!is_model_complete(dir.path(), &MARIAN_REQUIRED_FILES));

        fs::write(dir.path().join("config.json"), b"{}").unwrap();
        assert!(is_model_complete(dir.path(), &MARIAN_REQUIRED_FILES));
    }

    #[test]
    fn silero_size_sanity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silero_vad.onnx");
        assert!(!is_silero_model_valid(&path));

        fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(!is_silero_model_valid(&path));

        fs::write(&path, vec![0u8; 20_000]).unwrap();
        assert!(is_silero_model_valid(&path));
    }

    #[test]
    fn marian_cache_path_is_slash_safe() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("ct2").join("Helsinki-NLP_opus-mt-en-vi");
        // Conversion is not attempted when the cache is already complete.
        fs::create_dir_all(&expected).unwrap();
        fs::write(expected.join("model.bin"), b"x").unwrap();
        fs::write(expected.join("config.json"), b"{}").unwrap();

        let resolved = ensure_marian_model(dir.path(), "Helsinki-NLP/opus-mt-en-vi").unwrap();
        assert_eq!(resolved, expected);
    }
}
