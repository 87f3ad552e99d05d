pub mod asr_engine;
pub mod audio_source;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod post_processor;
pub mod protocol;
pub mod server;
pub mod translation;
pub mod vad_gate;

// Re-export key components for easier access
pub use asr_engine::AsrEngine;
pub use config::{AppConfig, DataDirs};
pub use engine::Engine;
pub use error::EngineError;
pub use pipeline::Pipeline;
pub use server::Broadcaster;
pub use translation::TranslationRouter;
pub use vad_gate::VadGate;
