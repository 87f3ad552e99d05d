//! Local MT backend
//!
//! Marian-class models on the CTranslate2 runtime, int8 on CPU / float16 on
//! GPU. Checkpoints convert to the runtime's native format on first load and
//! are cached under `models/ct2/<safe_name>/`.

use std::path::Path;

use ct2rs::tokenizers::auto::Tokenizer as AutoTokenizer;
use ct2rs::{BatchType, ComputeType, Config, Device, TranslationOptions, Translator};

use crate::config::{DevicePref, TranslationConfig};
use crate::error::{EngineError, Result};
use crate::translation::split_sentences;

const MAX_SENTENCE_CHARS: usize = 200;

/// Well-known checkpoints per language pair; anything else falls back to the
/// `opus-mt-{src}-{tgt}` naming convention.
const PRESET_MODELS: &[(&str, &str, &str)] = &[
    ("en", "vi", "Helsinki-NLP/opus-mt-en-vi"),
    ("en", "zh", "Helsinki-NLP/opus-mt-en-zh"),
    ("en", "ja", "Helsinki-NLP/opus-mt-en-jap"),
    ("en", "ko", "Helsinki-NLP/opus-mt-tc-big-en-ko"),
    ("en", "de", "Helsinki-NLP/opus-mt-en-de"),
    ("en", "fr", "Helsinki-NLP/opus-mt-en-fr"),
    ("en", "es", "Helsinki-NLP/opus-mt-en-es"),
    ("vi", "en", "Helsinki-NLP/opus-mt-vi-en"),
];

/// Resolve the checkpoint name for a language pair
pub fn model_for_pair(config: &TranslationConfig) -> String {
    if let Some(model) = &config.model {
        return model.clone();
    }

    PRESET_MODELS
        .iter()
        .find(|(src, tgt, _)| *src == config.source_lang && *tgt == config.target_lang)
        .map(|(_, _, name)| name.to_string())
        .unwrap_or_else(|| {
            format!(
                "Helsinki-NLP/opus-mt-{}-{}",
                config.source_lang, config.target_lang
            )
        })
}

pub struct LocalBackend {
    translator: Option<Translator>,
    options: TranslationOptions,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            translator: None,
            options: TranslationOptions {
                beam_size: 2,
                batch_type: BatchType::Tokens,
                max_batch_size: 2048,
                ..Default::default()
            },
        }
    }

    /// Load (converting if needed) the model for the configured pair.
    ///
    /// An explicit CPU request is honored verbatim. GPU loads run a one-token
    /// self-test before being accepted; runtime-library problems that only
    /// surface at first inference then trigger the CPU/int8 fallback.
    pub fn load_model(
        &mut self,
        config: &TranslationConfig,
        device: DevicePref,
        models_dir: &Path,
    ) -> Result<()> {
        let model_name = model_for_pair(config);
        let model_dir = crate::download::ensure_marian_model(models_dir, &model_name)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let translator = match device {
            DevicePref::Cpu => self.load_on(&model_dir, Device::CPU)?,
            DevicePref::Gpu | DevicePref::Auto => {
                match self.load_and_verify_gpu(&model_dir) {
                    Ok(translator) => translator,
                    Err(e) => {
                        tracing::warn!(
                            "GPU translator init failed: {}. Falling back to CPU (int8).",
                            e
                        );
                        self.load_on(&model_dir, Device::CPU)?
                    }
                }
            }
        };

        tracing::info!("Local translation model '{}' loaded", model_name);
        self.translator = Some(translator);
        Ok(())
    }

    fn load_on(&self, model_dir: &Path, device: Device) -> Result<Translator> {
        let compute_type = match device {
            Device::CUDA => ComputeType::FLOAT16,
            _ => ComputeType::INT8,
        };

        let config = Config {
            device,
            device_indices: vec![0],
            compute_type,
            tensor_parallel: false,
            num_threads_per_replica: num_cpus::get().min(4),
            max_queued_batches: 0,
            cpu_core_offset: -1,
        };

        Translator::new(model_dir, config).map_err(|e| EngineError::ModelLoad(e.to_string()))
    }

    fn load_and_verify_gpu(&self, model_dir: &Path) -> Result<Translator> {
        let translator = self.load_on(model_dir, Device::CUDA)?;

        // Missing CUDA runtime libraries crash at first inference, not at
        // load, so exercise one token before accepting the GPU instance.
        translator
            .translate_batch(&["test"], &self.options, None)
            .map_err(|e| EngineError::ModelLoad(format!("GPU self-test failed: {}", e)))?;

        Ok(translator)
    }

    pub fn unload_model(&mut self) {
        self.translator = None;
        tracing::info!("Local translation model unloaded");
    }

    pub fn is_loaded(&self) -> bool {
        self.translator.is_some()
    }

    /// Translate text sentence-by-sentence in one batch call
    pub fn translate(&self, text: &str, _source_lang: &str, _target_lang: &str) -> Result<String> {
        let translator = self
            .translator
            .as_ref()
            .ok_or_else(|| EngineError::Translation("local model not loaded".to_string()))?;

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(String::new());
        }

        let sentences = split_sentences(trimmed, MAX_SENTENCE_CHARS);
        let results = translator
            .translate_batch(&sentences, &self.options, None)
            .map_err(|e| EngineError::Translation(e.to_string()))?;

        let translated = results
            .into_iter()
            .map(|(sentence, _score)| sentence)
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();

        Ok(translated)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(src: &str, tgt: &str) -> TranslationConfig {
        TranslationConfig {
            source_lang: src.to_string(),
            target_lang: tgt.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn preset_pairs_resolve() {
        assert_eq!(model_for_pair(&pair("en", "vi")), "Helsinki-NLP/opus-mt-en-vi");
        assert_eq!(model_for_pair(&pair("en", "ja")), "Helsinki-NLP/opus-mt-en-jap");
        assert_eq!(model_for_pair(&pair("vi", "en")), "Helsinki-NLP/opus-mt-vi-en");
    }

    #[test]
    fn unknown_pair_uses_naming_convention() {
        assert_eq!(model_for_pair(&pair("de", "fr")), "Helsinki-NLP/opus-mt-de-fr");
    }

    #[test]
    fn explicit_model_overrides_presets() {
        let mut config = pair("en", "vi");
        config.model = Some("custom/mt-model".to_string());
        assert_eq!(model_for_pair(&config), "custom/mt-model");
    }

    #[test]
    fn unloaded_backend_refuses() {
        let backend = LocalBackend::new();
        assert!(!backend.is_loaded());
        assert!(backend.translate("hello", "en", "vi").is_err());
    }
}
