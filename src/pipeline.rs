//! Capture → VAD → ASR → translation → emit
//!
//! Three OS threads (capture, decoder, translator) joined by bounded queues,
//! plus one async emitter task draining results to the control plane. The
//! inference calls block, so the workers live on real threads; backpressure
//! is drop-oldest-never-block on the audio side.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::asr_engine::{AsrEngine, AsrSegment};
use crate::audio_source::AudioSource;
use crate::config::AppConfig;
use crate::error::Result;
use crate::protocol::OutboundMessage;
use crate::server::Broadcaster;
use crate::translation::{TranslationJob, TranslationRouter};
use crate::vad_gate::VadGate;

/// Silence run length that finalizes the current utterance
pub const SILENCE_FINALIZE_DELAY: Duration = Duration::from_millis(800);

/// Audio queue capacity: 500 frames ≈ 10 s at 20 ms frames
const AUDIO_QUEUE_CAP: usize = 500;

/// Translation queue capacity
const TRANSLATION_QUEUE_CAP: usize = 100;

/// Result queue capacity feeding the emitter task
const RESULT_QUEUE_CAP: usize = 256;

/// Decoder frame pop timeout
const DECODER_POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Extra frames batched per decoder iteration
const DECODER_BATCH_MAX: usize = 10;

/// How long the decoder may wait to enqueue a translation job
const TRANSLATION_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Worker join timeout at teardown
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running pipeline. `stop` is the only way to tear it down.
pub struct Pipeline {
    running: Arc<AtomicBool>,
    capture_handle: Option<JoinHandle<()>>,
    decoder_handle: Option<JoinHandle<()>>,
    translator_handle: Option<JoinHandle<()>>,
    emitter_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    /// Start the workers. The source is started before any thread spawns so
    /// device failures surface to the caller instead of a worker log.
    pub fn start(
        config: &AppConfig,
        mut source: Box<dyn AudioSource>,
        vad: VadGate,
        asr: AsrEngine,
        router: Option<TranslationRouter>,
        broadcaster: Broadcaster,
    ) -> Result<Self> {
        source.start()?;

        let running = Arc::new(AtomicBool::new(true));
        let (audio_tx, audio_rx) = bounded::<Vec<u8>>(AUDIO_QUEUE_CAP);
        let (translation_tx, translation_rx) = bounded::<TranslationJob>(TRANSLATION_QUEUE_CAP);
        let (result_tx, mut result_rx) =
            tokio::sync::mpsc::channel::<OutboundMessage>(RESULT_QUEUE_CAP);

        let capture_handle = spawn_capture(source, audio_tx, result_tx.clone(), running.clone());

        let translation = config.translation.clone();
        let decoder_handle = spawn_decoder(DecoderContext {
            audio_rx,
            vad,
            asr,
            translation_enabled: translation.enabled && router.is_some(),
            source_lang: translation.source_lang.clone(),
            target_lang: translation.target_lang.clone(),
            translation_tx,
            result_tx: result_tx.clone(),
            running: running.clone(),
        });

        let translator_handle = router.and_then(|router| {
            spawn_translator(router, translation_rx, result_tx.clone(), running.clone())
        });

        // The emitter owns the only long-lived result receiver; it ends when
        // every worker's sender has dropped.
        drop(result_tx);
        let emitter_handle = tokio::spawn(async move {
            while let Some(message) = result_rx.recv().await {
                broadcaster.broadcast(&message);
            }
            tracing::debug!("Emitter task finished");
        });

        tracing::info!("Pipeline started");
        Ok(Self {
            running,
            capture_handle,
            decoder_handle,
            translator_handle,
            emitter_handle: Some(emitter_handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Cancel and tear down: flip the running flag, join each worker with a
    /// bounded timeout, then wait for the emitter to drain the result queue.
    pub async fn stop(mut self) {
        tracing::info!("Stopping pipeline");
        self.running.store(false, Ordering::Relaxed);

        let capture = self.capture_handle.take();
        let decoder = self.decoder_handle.take();
        let translator = self.translator_handle.take();
        let join_result = tokio::task::spawn_blocking(move || {
            join_with_timeout("capture", capture, JOIN_TIMEOUT);
            join_with_timeout("decoder", decoder, JOIN_TIMEOUT);
            join_with_timeout("translator", translator, JOIN_TIMEOUT);
        })
        .await;
        if let Err(e) = join_result {
            tracing::error!("Worker join task panicked: {}", e);
        }

        if let Some(emitter) = self.emitter_handle.take() {
            let abort = emitter.abort_handle();
            if tokio::time::timeout(JOIN_TIMEOUT, emitter).await.is_err() {
                tracing::warn!("Emitter did not drain in time, aborting");
                abort.abort();
            }
        }

        tracing::info!("Pipeline stopped");
    }
}

fn join_with_timeout(name: &str, handle: Option<JoinHandle<()>>, timeout: Duration) {
    let Some(handle) = handle else {
        return;
    };
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        if let Err(e) = handle.join() {
            tracing::error!("{} thread panicked: {:?}", name, e);
        }
    } else {
        tracing::warn!("{} thread did not stop within {:?}", name, timeout);
    }
}

/// Capture thread: source frames into the audio queue, dropping when full.
fn spawn_capture(
    mut source: Box<dyn AudioSource>,
    audio_tx: Sender<Vec<u8>>,
    result_tx: tokio::sync::mpsc::Sender<OutboundMessage>,
    running: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            tracing::debug!("Capture thread started");
            let dropped = AtomicU64::new(0);

            while running.load(Ordering::Relaxed) {
                let chunk = match source.read_chunk() {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::error!("Audio source failed: {}", e);
                        let _ = result_tx.blocking_send(OutboundMessage::error(e.to_string()));
                        running.store(false, Ordering::Relaxed);
                        break;
                    }
                };

                if chunk.is_empty() {
                    // Source idle (or a finished file); yield instead of spinning
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }

                // Realtime audio: a full queue means the decoder is behind,
                // and stale samples are worthless. Drop, never block.
                if let Err(TrySendError::Full(_)) = audio_tx.try_send(chunk) {
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % 50 == 1 {
                        tracing::warn!("Audio queue full, dropped frames (total: {})", total);
                    }
                }
            }

            source.stop();
            tracing::debug!("Capture thread stopped");
        });

    match handle {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("Failed to spawn capture thread: {}", e);
            None
        }
    }
}

struct DecoderContext {
    audio_rx: Receiver<Vec<u8>>,
    vad: VadGate,
    asr: AsrEngine,
    translation_enabled: bool,
    source_lang: String,
    target_lang: String,
    translation_tx: Sender<TranslationJob>,
    result_tx: tokio::sync::mpsc::Sender<OutboundMessage>,
    running: Arc<AtomicBool>,
}

/// Decoder thread: VAD gate, streaming ASR, silence finalization.
fn spawn_decoder(mut ctx: DecoderContext) -> Option<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("decoder".to_string())
        .spawn(move || {
            tracing::debug!("Decoder thread started");
            let mut was_speech = false;
            let mut silence_start: Option<Instant> = None;

            while ctx.running.load(Ordering::Relaxed) {
                match ctx.audio_rx.recv_timeout(DECODER_POP_TIMEOUT) {
                    Ok(first) => {
                        // Batch a few more frames to amortize per-call cost
                        let mut blob = first;
                        for _ in 0..DECODER_BATCH_MAX {
                            match ctx.audio_rx.try_recv() {
                                Ok(more) => blob.extend_from_slice(&more),
                                Err(_) => break,
                            }
                        }

                        if ctx.vad.process(&blob) {
                            was_speech = true;
                            silence_start = None;
                            let segment = ctx.asr.transcribe_stream(&blob);
                            if let Some(segment) = segment {
                                handle_segment(&mut ctx, segment);
                            }
                        } else if was_speech {
                            silence_start.get_or_insert_with(Instant::now);
                            check_silence(&mut ctx, &mut was_speech, &mut silence_start);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        // No frames at all also counts as silence
                        if was_speech {
                            silence_start.get_or_insert_with(Instant::now);
                        }
                        check_silence(&mut ctx, &mut was_speech, &mut silence_start);
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            // One last commit so trailing speech is not lost on stop
            if let Some(segment) = ctx.asr.finalize_current() {
                handle_segment(&mut ctx, segment);
            }
            ctx.asr.unload_model();
            tracing::debug!("Decoder thread stopped");
        });

    match handle {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("Failed to spawn decoder thread: {}", e);
            None
        }
    }
}

fn check_silence(
    ctx: &mut DecoderContext,
    was_speech: &mut bool,
    silence_start: &mut Option<Instant>,
) {
    if !*was_speech {
        return;
    }
    let Some(start) = *silence_start else {
        return;
    };
    if start.elapsed() < SILENCE_FINALIZE_DELAY {
        return;
    }

    if let Some(segment) = ctx.asr.finalize_current() {
        handle_segment(ctx, segment);
    }
    ctx.vad.reset();
    *was_speech = false;
    *silence_start = None;
}

fn handle_segment(ctx: &mut DecoderContext, segment: AsrSegment) {
    let spawn_translation =
        ctx.translation_enabled && segment.is_final && !segment.text.trim().is_empty();

    let message = OutboundMessage::from_segment(&segment);
    if ctx.result_tx.blocking_send(message).is_err() {
        tracing::debug!("Result queue closed, dropping segment");
        return;
    }

    if spawn_translation {
        let job = TranslationJob {
            text: segment.text,
            source_lang: ctx.source_lang.clone(),
            target_lang: ctx.target_lang.clone(),
            entry_id: segment.entry_id,
        };
        match ctx
            .translation_tx
            .send_timeout(job, TRANSLATION_ENQUEUE_TIMEOUT)
        {
            Ok(()) => {}
            Err(e) => tracing::warn!("Translation queue full, dropping job: {}", e),
        }
    }
}

/// Translator thread: one router, one job at a time, FIFO.
fn spawn_translator(
    mut router: TranslationRouter,
    translation_rx: Receiver<TranslationJob>,
    result_tx: tokio::sync::mpsc::Sender<OutboundMessage>,
    running: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("translator".to_string())
        .spawn(move || {
            tracing::debug!("Translator thread started");

            while running.load(Ordering::Relaxed) {
                match translation_rx.recv_timeout(DECODER_POP_TIMEOUT) {
                    Ok(job) => {
                        let outcome = router.translate(&job);
                        if let Some(message) = OutboundMessage::from_translation(&outcome) {
                            if result_tx.blocking_send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            router.unload_model();
            tracing::debug!("Translator thread stopped");
        });

    match handle {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("Failed to spawn translator thread: {}", e);
            None
        }
    }
}
