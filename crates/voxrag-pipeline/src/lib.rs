//! Voice query orchestration.
//!
//! A [`Pipeline`] wires transcription, retrieval, generation, and synthesis
//! together. Each request runs as a [`PipelineRun`] that owns its scratch
//! files and reports the path it took through [`RunState`].

pub mod orchestrator;
pub mod prompt;
pub mod response;
pub mod run;

pub use orchestrator::{Pipeline, PipelineSettings};
pub use prompt::{PromptLimits, build_rag_prompt};
pub use response::{
    ErrorBody, QueryTiming, SynthesisResponse, TextAnswer, TranscriptionResponse, VoiceAnswer,
    VoiceOutcome,
};
pub use run::{PipelineRun, ResponseStatus, RunReport, RunState, StageTimings};
