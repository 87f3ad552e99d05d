use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Canonical sample rate used by every component downstream of the audio
/// source. Sources are responsible for resampling to this rate.
pub const SAMPLE_RATE: usize = 16000;

/// Default source frame duration in milliseconds
pub const CHUNK_MS: u64 = 20;

/// Whisper model size, keyed to the inference tuning table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl Default for ModelSize {
    fn default() -> Self {
        ModelSize::Base
    }
}

impl ModelSize {
    /// Inference tuning per model size: smaller models decode fast enough to
    /// re-run often over a longer window; larger models get a longer interval
    /// and a shorter window to bound latency.
    ///
    /// Returns `(inference_interval_secs, max_buffer_secs)`.
    pub fn tuning(self) -> (f32, f32) {
        match self {
            ModelSize::Tiny => (0.15, 5.0),
            ModelSize::Base => (0.20, 5.0),
            ModelSize::Small => (0.30, 4.0),
            ModelSize::Medium => (0.50, 3.0),
            ModelSize::Large => (0.60, 3.0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        }
    }
}

/// Device hint for model placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePref {
    Auto,
    Cpu,
    Gpu,
}

impl Default for DevicePref {
    fn default() -> Self {
        DevicePref::Auto
    }
}

/// Quantization / compute type for CTranslate2 inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePref {
    Int8,
    Float16,
    Int8Float16,
}

impl Default for ComputePref {
    fn default() -> Self {
        ComputePref::Int8
    }
}

/// Preferred translation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPref {
    Online,
    Local,
}

impl Default for BackendPref {
    fn default() -> Self {
        BackendPref::Online
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Source kind: "microphone" or "wav"
    pub source: String,
    /// Canonical sample rate in Hz
    pub sample_rate: usize,
    /// Source frame duration in milliseconds
    pub chunk_ms: u64,
    /// Input device name override (microphone source)
    pub device: Option<String>,
    /// Path to a WAV file when source == "wav"
    pub wav_path: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source: "microphone".to_string(),
            sample_rate: SAMPLE_RATE,
            chunk_ms: CHUNK_MS,
            device: None,
            wav_path: None,
        }
    }
}

impl AudioConfig {
    /// Frame size in bytes (int16 mono)
    pub fn chunk_bytes(&self) -> usize {
        self.sample_rate * 2 * self.chunk_ms as usize / 1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    pub model_size: ModelSize,
    /// Forced transcription language, None = auto-detect
    pub language: Option<String>,
    pub device: DevicePref,
    pub compute_type: ComputePref,
    /// Path to an already-converted CT2 model directory
    pub model_path: Option<PathBuf>,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            model_size: ModelSize::default(),
            language: None,
            device: DevicePref::default(),
            compute_type: ComputePref::default(),
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub enabled: bool,
    /// Speech probability threshold (0.0-1.0)
    pub threshold: f32,
    /// Consecutive speech-positive frames required to open the gate
    pub speech_pad_frames: usize,
    /// Consecutive speech-negative frames required to close the gate
    pub silence_pad_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            speech_pad_frames: 3,
            silence_pad_frames: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub backend: BackendPref,
    pub source_lang: String,
    pub target_lang: String,
    /// Local model id override (defaults to the preset for the pair)
    pub model: Option<String>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendPref::default(),
            source_lang: "en".to_string(),
            target_lang: "vi".to_string(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub asr: AsrConfig,
    pub vad: VadConfig,
    pub translation: TranslationConfig,
    pub logging: LoggingConfig,
}

/// Environment variable overrides, applied after the config file.
/// Values that fail to parse are skipped.
const ENV_MAP: &[(&str, &str, Cast)] = &[
    ("VOXTREAM_HOST", "server.host", Cast::Str),
    ("VOXTREAM_PORT", "server.port", Cast::Int),
    ("VOXTREAM_AUDIO_SOURCE", "audio.source", Cast::Str),
    ("VOXTREAM_SAMPLE_RATE", "audio.sample_rate", Cast::Int),
    ("VOXTREAM_CHUNK_MS", "audio.chunk_ms", Cast::Int),
    ("VOXTREAM_AUDIO_DEVICE", "audio.device", Cast::Str),
    ("VOXTREAM_MODEL_SIZE", "asr.model_size", Cast::Str),
    ("VOXTREAM_LANGUAGE", "asr.language", Cast::Str),
    ("VOXTREAM_COMPUTE_TYPE", "asr.compute_type", Cast::Str),
    ("VOXTREAM_DEVICE", "asr.device", Cast::Str),
    ("VOXTREAM_TRANSLATION_ENABLED", "translation.enabled", Cast::Bool),
    ("VOXTREAM_TRANSLATION_BACKEND", "translation.backend", Cast::Str),
    ("VOXTREAM_SOURCE_LANG", "translation.source_lang", Cast::Str),
    ("VOXTREAM_TARGET_LANG", "translation.target_lang", Cast::Str),
    ("VOXTREAM_TRANSLATION_MODEL", "translation.model", Cast::Str),
    ("VOXTREAM_VAD_ENABLED", "vad.enabled", Cast::Bool),
    ("VOXTREAM_VAD_THRESHOLD", "vad.threshold", Cast::Float),
    ("VOXTREAM_LOG_LEVEL", "logging.level", Cast::Str),
];

#[derive(Clone, Copy)]
enum Cast {
    Str,
    Int,
    Float,
    Bool,
}

impl Cast {
    fn parse(self, raw: &str) -> Option<Value> {
        match self {
            Cast::Str => Some(Value::String(raw.to_string())),
            Cast::Int => raw.parse::<i64>().ok().map(Value::from),
            Cast::Float => raw.parse::<f64>().ok().map(Value::from),
            Cast::Bool => match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
        }
    }
}

impl AppConfig {
    /// Load from a JSON file, falling back to defaults when the file is
    /// missing or malformed, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = AppConfig::default();

        if let Some(path) = path.filter(|p| p.exists()) {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => {
                        if let Err(e) = config.apply_patch(&value) {
                            tracing::warn!("Ignoring invalid config file {:?}: {}", path, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {:?}: {}. Using defaults.", path, e)
                    }
                },
                Err(e) => tracing::warn!("Failed to read {:?}: {}. Using defaults.", path, e),
            }
        }

        config.apply_env();
        config
    }

    /// Merge a JSON patch into this config. Accepts both nested objects
    /// (`{"asr": {"model_size": "small"}}`) and dotted-flat keys
    /// (`{"asr.model_size": "small"}`); clients send either shape.
    pub fn apply_patch(&mut self, patch: &Value) -> Result<()> {
        let nested = expand_dotted(patch);

        let mut base =
            serde_json::to_value(&*self).map_err(|e| EngineError::Config(e.to_string()))?;
        deep_merge(&mut base, &nested);

        *self = serde_json::from_value(base)
            .map_err(|e| EngineError::Config(format!("invalid config value: {}", e)))?;
        Ok(())
    }

    /// Apply `VOXTREAM_*` environment variable overrides
    pub fn apply_env(&mut self) {
        for (env_key, dotted, cast) in ENV_MAP {
            let Ok(raw) = std::env::var(env_key) else {
                continue;
            };
            let Some(value) = cast.parse(&raw) else {
                tracing::warn!("Ignoring malformed {}={}", env_key, raw);
                continue;
            };

            let mut patch = serde_json::Map::new();
            patch.insert(dotted.to_string(), value);
            if let Err(e) = self.apply_patch(&Value::Object(patch)) {
                tracing::warn!("Ignoring {}: {}", env_key, e);
            }
        }
    }
}

/// Expand dotted keys (`"asr.model_size"`) into nested objects, leaving
/// already-nested objects untouched.
fn expand_dotted(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };

    let mut root = serde_json::Map::new();
    for (key, val) in map {
        let expanded = expand_dotted(val);
        if key.contains('.') {
            let mut node: &mut serde_json::Map<String, Value> = &mut root;
            let parts: Vec<&str> = key.split('.').collect();
            for part in &parts[..parts.len() - 1] {
                let slot = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(serde_json::Map::new());
                }
                node = slot.as_object_mut().unwrap();
            }
            node.insert(parts[parts.len() - 1].to_string(), expanded);
        } else {
            match root.get_mut(key) {
                Some(existing) => deep_merge(existing, &expanded),
                None => {
                    root.insert(key.clone(), expanded);
                }
            }
        }
    }
    Value::Object(root)
}

fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, val) in patch_map {
                match base_map.get_mut(key) {
                    Some(slot) if slot.is_object() && val.is_object() => deep_merge(slot, val),
                    _ => {
                        base_map.insert(key.clone(), val.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Resolved per-user directory layout: `models/` for weights (including
/// CT2-converted checkpoints) and `logs/` for session logs.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl DataDirs {
    pub fn resolve() -> Result<Self> {
        let data_dir = match std::env::var_os("VOXTREAM_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .ok_or_else(|| EngineError::Config("no user data directory".to_string()))?
                .join("voxtream"),
        };

        let models_dir = match std::env::var_os("VOXTREAM_MODELS_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => data_dir.join("models"),
        };
        let logs_dir = data_dir.join("logs");

        for dir in [&data_dir, &models_dir, &logs_dir] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            data_dir,
            models_dir,
            logs_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_protocol() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.chunk_ms, 20);
        assert_eq!(config.audio.chunk_bytes(), 640);
        assert!(config.vad.enabled);
        assert!(!config.translation.enabled);
    }

    #[test]
    fn tuning_table() {
        assert_eq!(ModelSize::Tiny.tuning(), (0.15, 5.0));
        assert_eq!(ModelSize::Base.tuning(), (0.20, 5.0));
        assert_eq!(ModelSize::Small.tuning(), (0.30, 4.0));
        assert_eq!(ModelSize::Medium.tuning(), (0.50, 3.0));
        assert_eq!(ModelSize::Large.tuning(), (0.60, 3.0));
    }

    #[test]
    fn nested_patch() {
        let mut config = AppConfig::default();
        config
            .apply_patch(&json!({"asr": {"model_size": "small", "language": "en"}}))
            .unwrap();
        assert_eq!(config.asr.model_size, ModelSize::Small);
        assert_eq!(config.asr.language.as_deref(), Some("en"));
        // Unrelated sections keep their defaults
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn dotted_patch() {
        let mut config = AppConfig::default();
        config
            .apply_patch(&json!({
                "asr.model_size": "medium",
                "translation.enabled": true,
                "translation.target_lang": "de",
                "vad.threshold": 0.7,
            }))
            .unwrap();
        assert_eq!(config.asr.model_size, ModelSize::Medium);
        assert!(config.translation.enabled);
        assert_eq!(config.translation.target_lang, "de");
        assert!((config.vad.threshold - 0.7).abs() < 1e-6);
    }

    #[test]
    fn mixed_patch_shapes_merge() {
        let mut config = AppConfig::default();
        config
            .apply_patch(&json!({
                "asr": {"device": "cpu"},
                "asr.compute_type": "float16",
            }))
            .unwrap();
        assert_eq!(config.asr.device, DevicePref::Cpu);
        assert_eq!(config.asr.compute_type, ComputePref::Float16);
    }

    #[test]
    fn invalid_patch_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_patch(&json!({"asr.model_size": "gigantic"}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn cast_parsing() {
        assert!(matches!(Cast::Bool.parse("TRUE"), Some(Value::Bool(true))));
        assert!(matches!(Cast::Bool.parse("0"), Some(Value::Bool(false))));
        assert!(Cast::Bool.parse("maybe").is_none());
        assert_eq!(Cast::Int.parse("8765"), Some(Value::from(8765)));
        assert!(Cast::Int.parse("8765x").is_none());
        assert!(Cast::Float.parse("0.5").is_some());
    }
}
