//! Audio sources
//!
//! A source yields little-endian int16 mono PCM at the canonical sample rate;
//! any resampling or downmixing happens inside the source. The pipeline does
//! not care whether frames come from a microphone or a file.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, TrySendError};

use crate::error::{EngineError, Result};

/// Producer of raw PCM frames
pub trait AudioSource: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    /// Next frame of int16-LE mono PCM. Empty when no data is ready.
    fn read_chunk(&mut self) -> Result<Vec<u8>>;
    fn is_active(&self) -> bool;
}

/// Convert int16-LE PCM bytes to normalized f32 samples in [-1.0, 1.0)
pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Convert f32 samples back to int16-LE PCM bytes
pub fn f32_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Incremental linear resampler. Quality is sufficient for 16 kHz speech;
/// sources running at the canonical rate bypass it entirely.
struct LinearResampler {
    /// Input samples consumed per output sample
    ratio: f64,
    pos: f64,
    pending: Vec<f32>,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            ratio: from_rate as f64 / to_rate as f64,
            pos: 0.0,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, input: &[f32]) {
        self.pending.extend_from_slice(input);
    }

    /// Produce up to `max_out` output samples from the pending input
    fn pull(&mut self, max_out: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(max_out.min(self.pending.len()));
        while out.len() < max_out {
            let idx = self.pos.floor() as usize;
            if idx + 1 >= self.pending.len() {
                break;
            }
            let frac = (self.pos - idx as f64) as f32;
            let sample = self.pending[idx] * (1.0 - frac) + self.pending[idx + 1] * frac;
            out.push(sample);
            self.pos += self.ratio;
        }

        let consumed = (self.pos.floor() as usize).min(self.pending.len());
        self.pending.drain(..consumed);
        self.pos -= consumed as f64;
        out
    }
}

/// Microphone capture via cpal.
///
/// The cpal stream is owned by a dedicated thread (the stream type is not
/// `Send` on every host); samples cross into `read_chunk` over a bounded
/// channel that drops on overflow rather than blocking the audio callback.
pub struct MicrophoneSource {
    device_name: Option<String>,
    target_rate: u32,
    chunk_samples: usize,
    active: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    rx: Option<Receiver<Vec<f32>>>,
    resampler: Option<LinearResampler>,
    stream_thread: Option<std::thread::JoinHandle<()>>,
}

impl MicrophoneSource {
    pub fn new(device_name: Option<String>, target_rate: u32, chunk_ms: u64) -> Self {
        let chunk_samples = (target_rate as u64 * chunk_ms / 1000) as usize;
        Self {
            device_name,
            target_rate,
            chunk_samples,
            active: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            rx: None,
            resampler: None,
            stream_thread: None,
        }
    }

    pub fn dropped_callbacks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AudioSource for MicrophoneSource {
    fn start(&mut self) -> Result<()> {
        if self.active.load(Ordering::Relaxed) {
            return Ok(());
        }

        let (tx, rx) = bounded::<Vec<f32>>(64);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let active = self.active.clone();
        let dropped = self.dropped.clone();
        let device_name = self.device_name.clone();
        active.store(true, Ordering::Relaxed);

        let thread_active = active.clone();
        let handle = std::thread::Builder::new()
            .name("mic-stream".to_string())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), tx, dropped) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    tracing::error!("Failed to start input stream: {}", e);
                    thread_active.store(false, Ordering::Relaxed);
                    return;
                }

                while thread_active.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                // Stream drops here, closing the device
            })
            .map_err(|e| EngineError::Audio(e.to_string()))?;

        let native_rate = match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                self.active.store(false, Ordering::Relaxed);
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                self.active.store(false, Ordering::Relaxed);
                return Err(EngineError::Audio(
                    "timed out opening the input device".to_string(),
                ));
            }
        };

        tracing::info!(
            "Microphone capture started (native {} Hz -> {} Hz)",
            native_rate,
            self.target_rate
        );

        self.resampler = Some(LinearResampler::new(native_rate, self.target_rate));
        self.rx = Some(rx);
        self.stream_thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::Relaxed);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
        self.rx = None;
        self.resampler = None;
    }

    fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let (Some(rx), Some(resampler)) = (self.rx.as_ref(), self.resampler.as_mut()) else {
            return Err(EngineError::Audio("source not started".to_string()));
        };

        // Block briefly for the first batch, then drain whatever else arrived
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(batch) => resampler.push(&batch),
            Err(_) => return Ok(Vec::new()),
        }
        while let Ok(batch) = rx.try_recv() {
            resampler.push(&batch);
        }

        let samples = resampler.pull(self.chunk_samples);
        Ok(f32_to_bytes(&samples))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

type BuiltStream = (cpal::Stream, u32);

fn build_input_stream(
    device_name: Option<&str>,
    tx: crossbeam_channel::Sender<Vec<f32>>,
    dropped: Arc<AtomicU64>,
) -> Result<BuiltStream> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| EngineError::Audio(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| EngineError::Audio(format!("input device not found: {}", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| EngineError::Audio("no default input device".to_string()))?,
    };

    let default_config = device
        .default_input_config()
        .map_err(|e| EngineError::Audio(e.to_string()))?;
    let sample_format = default_config.sample_format();
    let stream_config: cpal::StreamConfig = default_config.into();
    let native_rate = stream_config.sample_rate.0;
    let channels = stream_config.channels as usize;

    let err_fn = |e| tracing::error!("Input stream error: {}", e);

    let send_mono = move |samples: Vec<f32>| {
        // Never block the audio callback; stale samples are worthless
        if let Err(TrySendError::Full(_)) = tx.try_send(samples) {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total % 100 == 1 {
                tracing::warn!("Capture channel full, dropped callbacks (total: {})", total);
            }
        }
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    send_mono(downmix(data, channels));
                },
                err_fn,
                None,
            )
            .map_err(|e| EngineError::Audio(e.to_string()))?,
        cpal::SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> =
                        data.iter().map(|&s| s as f32 / 32768.0).collect();
                    send_mono(downmix(&floats, channels));
                },
                err_fn,
                None,
            )
            .map_err(|e| EngineError::Audio(e.to_string()))?,
        cpal::SampleFormat::U16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> = data
                        .iter()
                        .map(|&s| (s as f32 - 32768.0) / 32768.0)
                        .collect();
                    send_mono(downmix(&floats, channels));
                },
                err_fn,
                None,
            )
            .map_err(|e| EngineError::Audio(e.to_string()))?,
        other => {
            return Err(EngineError::Audio(format!(
                "unsupported input sample format: {:?}",
                other
            )))
        }
    };

    Ok((stream, native_rate))
}

fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// WAV file source for offline runs and tests.
///
/// Re-chunks the file into `chunk_ms` frames and, when pacing is enabled,
/// sleeps one frame duration per chunk to simulate a live device.
pub struct WavFileSource {
    path: std::path::PathBuf,
    target_rate: u32,
    chunk_ms: u64,
    pace: bool,
    samples: Vec<f32>,
    position: usize,
    active: bool,
}

impl WavFileSource {
    pub fn new(path: impl Into<std::path::PathBuf>, target_rate: u32, chunk_ms: u64, pace: bool) -> Self {
        Self {
            path: path.into(),
            target_rate,
            chunk_ms,
            pace,
            samples: Vec::new(),
            position: 0,
            active: false,
        }
    }

    fn chunk_samples(&self) -> usize {
        (self.target_rate as u64 * self.chunk_ms / 1000) as usize
    }
}

impl AudioSource for WavFileSource {
    fn start(&mut self) -> Result<()> {
        let reader = hound::WavReader::open(&self.path)
            .map_err(|e| EngineError::Audio(format!("failed to open {:?}: {}", self.path, e)))?;
        let spec = reader.spec();

        let mono: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
                let raw: Vec<f32> = reader
                    .into_samples::<i32>()
                    .filter_map(|s| s.ok())
                    .map(|s| s as f32 / max)
                    .collect();
                downmix(&raw, spec.channels as usize)
            }
            hound::SampleFormat::Float => {
                let raw: Vec<f32> = reader
                    .into_samples::<f32>()
                    .filter_map(|s| s.ok())
                    .collect();
                downmix(&raw, spec.channels as usize)
            }
        };

        self.samples = if spec.sample_rate == self.target_rate {
            mono
        } else {
            let mut resampler = LinearResampler::new(spec.sample_rate, self.target_rate);
            resampler.push(&mono);
            resampler.pull(usize::MAX / 2)
        };

        tracing::info!(
            "WAV source {:?}: {:.2}s at {} Hz",
            self.path,
            self.samples.len() as f32 / self.target_rate as f32,
            self.target_rate
        );
        self.position = 0;
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn read_chunk(&mut self) -> Result<Vec<u8>> {
        if !self.active || self.position >= self.samples.len() {
            self.active = false;
            return Ok(Vec::new());
        }

        if self.pace {
            std::thread::sleep(Duration::from_millis(self.chunk_ms));
        }

        let end = (self.position + self.chunk_samples()).min(self.samples.len());
        let chunk = f32_to_bytes(&self.samples[self.position..end]);
        self.position = end;
        Ok(chunk)
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trip_range() {
        let mut bytes = Vec::new();
        for value in [i16::MIN, -12345, -1, 0, 1, 12345, i16::MAX] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let floats = bytes_to_f32(&bytes);
        assert_eq!(floats.len(), 7);
        for (f, value) in floats.iter().zip([i16::MIN, -12345, -1, 0, 1, 12345, i16::MAX]) {
            assert!(*f >= -1.0 && *f < 1.0);
            assert!((f - value as f32 / 32768.0).abs() < 1e-6);
        }
    }

    #[test]
    fn pcm_odd_trailing_byte_ignored() {
        let floats = bytes_to_f32(&[0x00, 0x40, 0x7f]);
        assert_eq!(floats.len(), 1);
    }

    #[test]
    fn resampler_identity() {
        let mut resampler = LinearResampler::new(16000, 16000);
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        resampler.push(&input);
        let out = resampler.pull(50);
        assert_eq!(out.len(), 50);
        for (i, sample) in out.iter().enumerate() {
            assert!((sample - i as f32).abs() < 1e-4);
        }
    }

    #[test]
    fn resampler_downsamples_by_ratio() {
        let mut resampler = LinearResampler::new(48000, 16000);
        let input = vec![0.5f32; 4800];
        resampler.push(&input);
        let out = resampler.pull(10_000);
        // 4800 input samples at 3:1 yields ~1600 output samples
        assert!((out.len() as i64 - 1600).unsigned_abs() <= 2);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-4));
    }

    #[test]
    fn downmix_stereo_averages() {
        let samples = [1.0f32, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(downmix(&samples, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn wav_source_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..16000 {
            let t = i as f32 / 16000.0;
            let sample = (t * 440.0 * std::f32::consts::TAU).sin();
            writer.write_sample((sample * 8000.0) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavFileSource::new(&path, 16000, 20, false);
        source.start().unwrap();
        assert!(source.is_active());

        let mut total_bytes = 0;
        loop {
            let chunk = source.read_chunk().unwrap();
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 640);
            total_bytes += chunk.len();
        }
        // 1 second at 16 kHz int16
        assert_eq!(total_bytes, 32000);
        assert!(!source.is_active());
    }
}
