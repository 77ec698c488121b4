//! Audio side of the pipeline: ingest, normalization, STT and TTS.

pub mod ingest;
pub mod normalize;
pub mod stt;
pub mod tts;
