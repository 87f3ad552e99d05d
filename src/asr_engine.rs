//! Streaming ASR over a batch decoder
//!
//! The Whisper-class model decodes a whole audio window per call, so the
//! streaming feel comes from re-decoding a sliding window on a throttle and
//! committing completed segments out of it. Committed audio leaves the window;
//! everything still inside it may be revised by the next decode.

use std::path::Path;
use std::time::{Duration, Instant};

use ct2rs::{ComputeType, Config, Device, Whisper, WhisperOptions};

use crate::audio_source::bytes_to_f32;
use crate::config::{AsrConfig, ComputePref, DevicePref};
use crate::error::{EngineError, Result};
use crate::post_processor::{clean_repetitions, clean_with_flag, enforce_word_limit};

/// Minimum buffered audio before the first decode
const MIN_WINDOW_SECS: f32 = 0.3;

/// Window age that forces a full finalize even without a segment boundary
const FINALIZATION_THRESHOLD_SECS: f32 = 10.0;

/// One transcript emission
#[derive(Debug, Clone)]
pub struct AsrSegment {
    pub text: String,
    pub is_final: bool,
    pub language: Option<String>,
    pub confidence: Option<f32>,
    /// Monotonic tag carried by finals so translations can be correlated
    pub entry_id: Option<u64>,
}

/// The engine's append-only float32 window of uncommitted audio
#[derive(Debug, Default)]
pub struct AudioWindow {
    samples: Vec<f32>,
    sample_rate: usize,
}

impl AudioWindow {
    fn new(sample_rate: usize) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    /// Drop committed audio up to `cut_secs`
    fn truncate_front_secs(&mut self, cut_secs: f32) {
        let cut_samples = ((cut_secs * self.sample_rate as f32) as usize).min(self.samples.len());
        self.samples.drain(..cut_samples);
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

/// One decoder segment parsed from timestamped output
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSegment {
    pub start: f32,
    pub end: f32,
    pub text: String,
}

/// Parse Whisper's timestamped output (`<|0.00|> text <|1.38|>…`) into
/// segments. Non-timestamp special tokens are dropped; output without any
/// timestamp markers becomes a single segment spanning the window.
fn parse_timestamped_output(raw: &str, fallback_end: f32) -> Vec<DecodedSegment> {
    let mut segments = Vec::new();
    let mut current_start: Option<f32> = None;
    let mut current_text = String::new();
    let mut rest = raw;

    let mut flush = |start: Option<f32>, end: f32, text: &mut String, out: &mut Vec<DecodedSegment>| {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push(DecodedSegment {
                start: start.unwrap_or(0.0),
                end,
                text: trimmed.to_string(),
            });
        }
        text.clear();
    };

    while let Some(open) = rest.find("<|") {
        let (before, after_open) = rest.split_at(open);
        current_text.push_str(before);

        let Some(close) = after_open.find("|>") else {
            // Unterminated token: treat the remainder as plain text
            current_text.push_str(after_open);
            rest = "";
            break;
        };

        let inner = &after_open[2..close];
        if let Ok(timestamp) = inner.parse::<f32>() {
            flush(current_start, timestamp, &mut current_text, &mut segments);
            current_start = Some(timestamp);
        }
        // Other special tokens (language tags etc.) are dropped

        rest = &after_open[close + 2..];
    }
    current_text.push_str(rest);
    flush(current_start, fallback_end, &mut current_text, &mut segments);

    segments
}

/// What to do with one decode's segments
#[derive(Debug, Clone, PartialEq)]
enum EmissionPlan {
    Nothing,
    Partial {
        text: String,
    },
    Final {
        text: String,
        /// Commit boundary in seconds; None clears the whole window
        cut_secs: Option<f32>,
    },
}

/// Segment-boundary commit policy.
///
/// Hallucinated output finalizes and discards the whole window (the audio is
/// untrustworthy). With two or more segments, everything but the last is
/// committed and cut out of the window. An over-age or over-cap window
/// force-finalizes. Otherwise the joined text is a revisable partial.
fn plan_emission(segments: &[DecodedSegment], window_secs: f32, over_cap: bool) -> EmissionPlan {
    let joined = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let outcome = clean_with_flag(&joined);

    if outcome.hallucinated {
        tracing::debug!("Hallucination detected, discarding window: {:?}", joined);
        return EmissionPlan::Final {
            text: enforce_word_limit(&outcome.text, window_secs),
            cut_secs: None,
        };
    }

    if segments.len() >= 2 {
        let committed = &segments[..segments.len() - 1];
        let cut = committed[committed.len() - 1].end;
        let head = committed
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        return EmissionPlan::Final {
            text: enforce_word_limit(&clean_repetitions(&head), cut.max(0.0)),
            cut_secs: Some(cut),
        };
    }

    if over_cap || window_secs > FINALIZATION_THRESHOLD_SECS {
        return EmissionPlan::Final {
            text: enforce_word_limit(&outcome.text, window_secs),
            cut_secs: None,
        };
    }

    if outcome.text.is_empty() {
        EmissionPlan::Nothing
    } else {
        EmissionPlan::Partial { text: outcome.text }
    }
}

/// Streaming Whisper engine. Owned exclusively by the decoder thread.
pub struct AsrEngine {
    whisper: Option<Whisper>,
    options: WhisperOptions,
    language: Option<String>,
    sample_rate: usize,
    window: AudioWindow,
    inference_interval: Duration,
    max_buffer_samples: usize,
    last_inference: Option<Instant>,
    next_entry_id: u64,
}

impl AsrEngine {
    pub fn new(sample_rate: usize) -> Self {
        Self {
            whisper: None,
            options: WhisperOptions::default(),
            language: None,
            sample_rate,
            window: AudioWindow::new(sample_rate),
            inference_interval: Duration::from_millis(200),
            max_buffer_samples: 5 * sample_rate,
            last_inference: None,
            next_entry_id: 0,
        }
    }

    /// Load the Whisper model, converting the checkpoint on first use.
    ///
    /// A GPU request that fails for any reason (missing runtime, no device)
    /// falls back to CPU with int8 compute; an explicit CPU request is
    /// honored verbatim. On CPU, float16 compute types downgrade to int8.
    pub fn load_model(&mut self, config: &AsrConfig, models_dir: &Path) -> Result<()> {
        let model_dir = match &config.model_path {
            Some(path) => path.clone(),
            None => {
                let checkpoint = crate::download::whisper_checkpoint_for(config.model_size);
                crate::download::ensure_whisper_model(models_dir, checkpoint)
                    .map_err(|e| EngineError::ModelLoad(e.to_string()))?
            }
        };

        let (interval_secs, max_buffer_secs) = config.model_size.tuning();
        self.inference_interval = Duration::from_secs_f32(interval_secs);
        self.max_buffer_samples = (max_buffer_secs * self.sample_rate as f32) as usize;
        self.language = config.language.clone();

        // Greedy decoding: the window is re-decoded constantly, so beams buy
        // nothing, and conditioning on previous text compounds loops.
        self.options = WhisperOptions {
            beam_size: 1,
            patience: 1.0,
            repetition_penalty: 1.0,
            ..Default::default()
        };

        let whisper = match config.device {
            DevicePref::Cpu => self.load_on(&model_dir, Device::CPU, config.compute_type)?,
            DevicePref::Gpu | DevicePref::Auto => {
                match self.load_on(&model_dir, Device::CUDA, config.compute_type) {
                    Ok(whisper) => whisper,
                    Err(e) => {
                        tracing::warn!(
                            "GPU model load failed: {}. Falling back to CPU (int8).",
                            e
                        );
                        self.load_on(&model_dir, Device::CPU, ComputePref::Int8)?
                    }
                }
            }
        };

        tracing::info!(
            "ASR model '{}' loaded (interval {:?}, window cap {:.1}s)",
            config.model_size.as_str(),
            self.inference_interval,
            max_buffer_secs
        );
        self.whisper = Some(whisper);
        self.window.clear();
        self.last_inference = None;
        Ok(())
    }

    fn load_on(
        &self,
        model_dir: &Path,
        device: Device,
        compute_pref: ComputePref,
    ) -> Result<Whisper> {
        let compute_type = match (device, compute_pref) {
            (Device::CPU, ComputePref::Float16) | (Device::CPU, ComputePref::Int8Float16) => {
                // Most CPU kernels lack float16
                tracing::info!("CPU mode: downgrading compute type to int8");
                ComputeType::INT8
            }
            (_, ComputePref::Int8) => ComputeType::INT8,
            (_, ComputePref::Float16) => ComputeType::FLOAT16,
            (_, ComputePref::Int8Float16) => ComputeType::INT8_FLOAT16,
        };

        let ct2_config = Config {
            device,
            device_indices: vec![0],
            compute_type,
            tensor_parallel: false,
            num_threads_per_replica: num_cpus::get().min(4),
            max_queued_batches: 0,
            cpu_core_offset: -1,
        };

        Whisper::new(model_dir, ct2_config)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))
    }

    pub fn unload_model(&mut self) {
        self.whisper = None;
        self.window.clear();
        self.last_inference = None;
        tracing::info!("ASR model unloaded");
    }

    pub fn is_loaded(&self) -> bool {
        self.whisper.is_some()
    }

    /// Current uncommitted window length in samples (cap invariant checks)
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn max_buffer_samples(&self) -> usize {
        self.max_buffer_samples
    }

    /// Append a PCM chunk and maybe emit a transcript.
    ///
    /// Returns `None` while throttled or when the decode yields nothing, a
    /// partial while the window has no committed boundary, or a final when a
    /// boundary commits (the committed audio leaves the window).
    pub fn transcribe_stream(&mut self, chunk: &[u8]) -> Option<AsrSegment> {
        if self.whisper.is_none() {
            return None;
        }

        self.window.push(&bytes_to_f32(chunk));

        let window_secs = self.window.duration_secs();
        if window_secs < MIN_WINDOW_SECS {
            return None;
        }

        let over_cap = self.window.len() >= self.max_buffer_samples;
        if !over_cap {
            if let Some(last) = self.last_inference {
                if last.elapsed() < self.inference_interval {
                    return None;
                }
            }
        }

        let segments = match self.decode() {
            Ok(segments) => segments,
            Err(e) => {
                tracing::warn!("Transient decode failure: {}", e);
                if over_cap {
                    // The cap is a hard ceiling even when the decode fails
                    self.window.clear();
                }
                return None;
            }
        };

        match plan_emission(&segments, window_secs, over_cap) {
            EmissionPlan::Nothing => None,
            EmissionPlan::Partial { text } => Some(AsrSegment {
                text,
                is_final: false,
                language: self.language.clone(),
                confidence: None,
                entry_id: None,
            }),
            EmissionPlan::Final { text, cut_secs } => {
                match cut_secs {
                    Some(cut) => self.window.truncate_front_secs(cut),
                    None => self.window.clear(),
                }
                self.emit_final(text)
            }
        }
    }

    /// Force a final decode of whatever the window holds, then clear it.
    pub fn finalize_current(&mut self) -> Option<AsrSegment> {
        if self.whisper.is_none() || self.window.is_empty() {
            self.window.clear();
            return None;
        }

        let window_secs = self.window.duration_secs();
        let result = self.decode();
        self.window.clear();

        let segments = match result {
            Ok(segments) => segments,
            Err(e) => {
                tracing::warn!("Finalize decode failed: {}", e);
                return None;
            }
        };

        let joined = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let text = enforce_word_limit(&clean_with_flag(&joined).text, window_secs);
        self.emit_final(text)
    }

    /// Drop the window without decoding
    pub fn reset_stream(&mut self) {
        self.window.clear();
        self.last_inference = None;
    }

    fn emit_final(&mut self, text: String) -> Option<AsrSegment> {
        if text.is_empty() {
            // Forced finals over silence decode to nothing; suppress them
            return None;
        }
        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;
        Some(AsrSegment {
            text,
            is_final: true,
            language: self.language.clone(),
            confidence: None,
            entry_id: Some(entry_id),
        })
    }

    fn decode(&mut self) -> Result<Vec<DecodedSegment>> {
        let whisper = self
            .whisper
            .as_ref()
            .ok_or_else(|| EngineError::Decode("model not loaded".to_string()))?;

        let window_secs = self.window.duration_secs();
        self.last_inference = Some(Instant::now());

        // The gate upstream already filters silence; the model's own VAD
        // stays off so the two never disagree.
        let results = whisper
            .generate(
                self.window.as_slice(),
                self.language.as_deref(),
                false,
                &self.options,
            )
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        let raw = results.first().map(String::as_str).unwrap_or("");
        Ok(parse_timestamped_output(raw, window_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f32, end: f32, text: &str) -> DecodedSegment {
        DecodedSegment {
            start,
            end,
            text: text.to_string(),
        }
    }

    #[test]
    fn parse_plain_text() {
        let segments = parse_timestamped_output("hello world", 2.0);
        assert_eq!(segments, vec![seg(0.0, 2.0, "hello world")]);
    }

    #[test]
    fn parse_timestamp_pairs() {
        let segments =
            parse_timestamped_output("<|0.00|> hello world<|1.20|><|1.20|> how are you<|2.50|>", 3.0);
        assert_eq!(
            segments,
            vec![seg(0.0, 1.2, "hello world"), seg(1.2, 2.5, "how are you")]
        );
    }

    #[test]
    fn parse_drops_special_tokens() {
        let segments = parse_timestamped_output("<|en|><|transcribe|><|0.00|> hi<|0.80|>", 1.0);
        assert_eq!(segments, vec![seg(0.0, 0.8, "hi")]);
    }

    #[test]
    fn parse_trailing_text_uses_fallback_end() {
        let segments = parse_timestamped_output("<|0.00|> unfinished thought", 1.5);
        assert_eq!(segments, vec![seg(0.0, 1.5, "unfinished thought")]);
    }

    #[test]
    fn parse_empty() {
        assert!(parse_timestamped_output("", 1.0).is_empty());
        assert!(parse_timestamped_output("<|0.00|><|1.00|>", 1.0).is_empty());
    }

    #[test]
    fn plan_single_segment_is_partial() {
        let plan = plan_emission(&[seg(0.0, 1.0, "hello there")], 1.0, false);
        assert_eq!(
            plan,
            EmissionPlan::Partial {
                text: "hello there".to_string()
            }
        );
    }

    #[test]
    fn plan_multi_segment_commits_head() {
        let segments = [
            seg(0.0, 1.5, "first sentence"),
            seg(1.5, 2.8, "second sentence"),
            seg(2.8, 3.4, "still speaking"),
        ];
        let plan = plan_emission(&segments, 3.4, false);
        assert_eq!(
            plan,
            EmissionPlan::Final {
                text: "first sentence second sentence".to_string(),
                cut_secs: Some(2.8),
            }
        );
    }

    #[test]
    fn plan_over_cap_forces_final() {
        let plan = plan_emission(&[seg(0.0, 5.0, "kept talking for ages")], 5.0, true);
        assert_eq!(
            plan,
            EmissionPlan::Final {
                text: "kept talking for ages".to_string(),
                cut_secs: None,
            }
        );
    }

    #[test]
    fn plan_old_window_forces_final() {
        let plan = plan_emission(&[seg(0.0, 10.5, "a very long utterance")], 10.5, false);
        assert!(matches!(plan, EmissionPlan::Final { cut_secs: None, .. }));
    }

    #[test]
    fn plan_hallucination_discards_window() {
        let segments = [seg(0.0, 2.0, "ok ok ok ok ok ok ok ok ok ok")];
        let plan = plan_emission(&segments, 2.0, false);
        let EmissionPlan::Final { text, cut_secs } = plan else {
            panic!("expected final");
        };
        assert_eq!(cut_secs, None);
        let ok_count = text.split_whitespace().filter(|w| *w == "ok").count();
        assert!(ok_count <= 3);
    }

    #[test]
    fn plan_empty_segments_is_nothing() {
        assert_eq!(plan_emission(&[], 1.0, false), EmissionPlan::Nothing);
    }

    #[test]
    fn window_truncation() {
        let mut window = AudioWindow::new(16000);
        window.push(&vec![0.1; 32000]);
        assert!((window.duration_secs() - 2.0).abs() < 1e-3);

        window.truncate_front_secs(1.5);
        assert_eq!(window.len(), 8000);

        window.truncate_front_secs(10.0);
        assert!(window.is_empty());
    }

    #[test]
    fn unloaded_engine_swallows_audio() {
        let mut engine = AsrEngine::new(16000);
        assert!(engine.transcribe_stream(&[0u8; 640]).is_none());
        assert!(engine.finalize_current().is_none());
        assert_eq!(engine.window_len(), 0);
    }
}
