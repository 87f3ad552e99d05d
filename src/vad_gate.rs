//! Frame-level voice activity gate
//!
//! Wraps the Silero VAD ONNX model. Incoming PCM frames accumulate until a
//! full 512-sample model window is available; each window produces a speech
//! probability that drives a hysteresis gate, so single noisy frames cannot
//! flip the decision.

use std::path::Path;

use ndarray::{Array, Array2, ArrayBase, ArrayD, Dim, IxDynImpl, OwnedRepr};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputs};
use ort::value::Tensor;

use crate::audio_source::bytes_to_f32;
use crate::config::VadConfig;

/// Samples per model window (Silero expects 512 at 16 kHz)
pub const WINDOW_SAMPLES: usize = 512;

/// Hysteresis parameters for the gate
#[derive(Debug, Clone, Copy)]
pub struct GateParams {
    pub threshold: f32,
    /// Consecutive speech-positive frames to open the gate
    pub speech_pad_frames: usize,
    /// Consecutive speech-negative frames to close the gate
    pub silence_pad_frames: usize,
}

impl From<&VadConfig> for GateParams {
    fn from(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            speech_pad_frames: config.speech_pad_frames,
            silence_pad_frames: config.silence_pad_frames,
        }
    }
}

/// Pure hysteresis state, separate from the model so the transition logic is
/// testable without an ONNX session.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateState {
    is_speech: bool,
    speech_run: usize,
    silence_run: usize,
}

impl GateState {
    pub fn update(&mut self, frame_is_speech: bool, params: &GateParams) -> bool {
        if frame_is_speech {
            self.speech_run += 1;
            self.silence_run = 0;
        } else {
            self.silence_run += 1;
            self.speech_run = 0;
        }

        if !self.is_speech && self.speech_run >= params.speech_pad_frames {
            self.is_speech = true;
            tracing::debug!("Speech start after {} frames", self.speech_run);
        }
        if self.is_speech && self.silence_run >= params.silence_pad_frames {
            self.is_speech = false;
            tracing::debug!("Speech end after {} silent frames", self.silence_run);
        }

        self.is_speech
    }

    pub fn is_speech(&self) -> bool {
        self.is_speech
    }

    pub fn reset(&mut self) {
        *self = GateState::default();
    }
}

/// One inference step of the Silero model: `x[1, 512], sr, h, c` in,
/// `prob, h', c'` out. The recurrent state lives here.
struct SileroModel {
    session: Session,
    sample_rate: ArrayBase<OwnedRepr<i64>, Dim<[usize; 1]>>,
    h: ArrayBase<OwnedRepr<f32>, Dim<IxDynImpl>>,
    c: ArrayBase<OwnedRepr<f32>, Dim<IxDynImpl>>,
    window_buffer: Array2<f32>,
}

impl SileroModel {
    fn new(model_path: &Path, sample_rate: usize) -> Result<Self, ort::Error> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .with_inter_threads(1)?
            .commit_from_file(model_path)?;

        let sample_rate_arr =
            Array::from_shape_vec([1], vec![sample_rate as i64]).expect("fixed shape");

        Ok(Self {
            session,
            sample_rate: sample_rate_arr,
            h: ArrayD::<f32>::zeros([2, 1, 64].as_slice()),
            c: ArrayD::<f32>::zeros([2, 1, 64].as_slice()),
            window_buffer: Array2::<f32>::zeros((1, WINDOW_SAMPLES)),
        })
    }

    fn reset(&mut self) {
        self.h = ArrayD::<f32>::zeros([2, 1, 64].as_slice());
        self.c = ArrayD::<f32>::zeros([2, 1, 64].as_slice());
    }

    /// Speech probability for one full window, updating `(h, c)`
    fn infer(&mut self, window: &[f32]) -> Result<f32, ort::Error> {
        debug_assert_eq!(window.len(), WINDOW_SAMPLES);
        for (i, &sample) in window.iter().enumerate() {
            self.window_buffer[[0, i]] = sample;
        }

        let x_tensor = Tensor::from_array(self.window_buffer.to_owned())?;
        let sr_tensor = Tensor::from_array(self.sample_rate.to_owned())?;
        let h_tensor = Tensor::from_array(std::mem::take(&mut self.h))?;
        let c_tensor = Tensor::from_array(std::mem::take(&mut self.c))?;

        let inps = ort::inputs![x_tensor, sr_tensor, h_tensor, c_tensor];
        let res = self.session.run(SessionInputs::ValueSlice::<4>(&inps))?;

        self.h = res["hn"].try_extract_array()?.to_owned();
        self.c = res["cn"].try_extract_array()?.to_owned();

        let output = res["output"].try_extract_tensor::<f32>()?;
        Ok(output.1[0])
    }
}

/// The frame-level speech/silence decision used by the decoder thread.
pub struct VadGate {
    model: Option<SileroModel>,
    enabled: bool,
    params: GateParams,
    gate: GateState,
    /// Residual samples waiting for a full model window
    accumulator: Vec<f32>,
    /// Verdict of the most recently completed window, reused for calls that
    /// do not fill a window
    last_window_speech: bool,
}

impl VadGate {
    /// Build the gate. A model load failure disables the gate rather than
    /// failing the pipeline; `process` then reports speech unconditionally so
    /// the ASR engine still sees audio.
    pub fn new(config: &VadConfig, model_path: &Path, sample_rate: usize) -> Self {
        let model = if config.enabled {
            match SileroModel::new(model_path, sample_rate) {
                Ok(model) => Some(model),
                Err(e) => {
                    tracing::warn!(
                        "Failed to load VAD model from {:?}: {}. Gate disabled (fail-open).",
                        model_path,
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            model,
            enabled: config.enabled,
            params: GateParams::from(config),
            gate: GateState::default(),
            accumulator: Vec::with_capacity(WINDOW_SAMPLES * 2),
            last_window_speech: false,
        }
    }

    /// Current gate decision for this PCM frame
    pub fn process(&mut self, frame: &[u8]) -> bool {
        let Some(model) = self.model.as_mut() else {
            // Disabled or failed to load: everything is speech
            return true;
        };

        self.accumulator.extend(bytes_to_f32(frame));

        // A call may drain several windows (the decoder batches frames);
        // any one of them exceeding the threshold asserts speech for the
        // whole call.
        let mut any_window_speech = false;
        let mut windows_run = false;
        while self.accumulator.len() >= WINDOW_SAMPLES {
            windows_run = true;
            let window: Vec<f32> = self.accumulator.drain(..WINDOW_SAMPLES).collect();
            match model.infer(&window) {
                Ok(prob) => {
                    any_window_speech = any_window_speech || prob > self.params.threshold;
                }
                Err(e) => {
                    tracing::warn!("VAD inference failed: {}. Treating frame as speech.", e);
                    any_window_speech = true;
                }
            }
        }

        if windows_run {
            self.last_window_speech = any_window_speech;
        }

        self.gate.update(self.last_window_speech, &self.params)
    }

    /// Clear recurrent state, residual samples, and hysteresis counters
    pub fn reset(&mut self) {
        if let Some(model) = self.model.as_mut() {
            model.reset();
        }
        self.accumulator.clear();
        self.gate.reset();
        self.last_window_speech = false;
    }

    pub fn is_speech(&self) -> bool {
        !self.enabled || self.model.is_none() || self.gate.is_speech()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GateParams {
        GateParams {
            threshold: 0.5,
            speech_pad_frames: 3,
            silence_pad_frames: 8,
        }
    }

    #[test]
    fn opens_only_after_speech_pad() {
        let params = params();
        let mut gate = GateState::default();

        assert!(!gate.update(true, &params));
        assert!(!gate.update(true, &params));
        // Third consecutive speech frame opens the gate
        assert!(gate.update(true, &params));
    }

    #[test]
    fn closes_only_after_silence_pad() {
        let params = params();
        let mut gate = GateState::default();
        for _ in 0..3 {
            gate.update(true, &params);
        }
        assert!(gate.is_speech());

        for _ in 0..7 {
            assert!(gate.update(false, &params));
        }
        // Eighth consecutive silence frame closes the gate
        assert!(!gate.update(false, &params));
    }

    #[test]
    fn alternating_frames_never_transition() {
        let params = params();
        let mut gate = GateState::default();

        for i in 0..100 {
            let verdict = gate.update(i % 2 == 0, &params);
            assert!(!verdict, "gate opened on alternating input at frame {}", i);
        }
    }

    #[test]
    fn interrupted_silence_keeps_gate_open() {
        let params = params();
        let mut gate = GateState::default();
        for _ in 0..3 {
            gate.update(true, &params);
        }

        // 7 silence frames, one speech frame, 7 more silence frames:
        // the counter restarts, so the gate stays open throughout
        for _ in 0..7 {
            assert!(gate.update(false, &params));
        }
        assert!(gate.update(true, &params));
        for _ in 0..7 {
            assert!(gate.update(false, &params));
        }
        assert!(gate.is_speech());
    }

    #[test]
    fn reset_clears_counters() {
        let params = params();
        let mut gate = GateState::default();
        gate.update(true, &params);
        gate.update(true, &params);
        gate.reset();

        assert!(!gate.update(true, &params));
        assert!(!gate.update(true, &params));
        assert!(gate.update(true, &params));
    }
}
