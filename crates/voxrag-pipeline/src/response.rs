//! JSON bodies returned to callers.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;

use voxrag_core::error::PipelineError;
use voxrag_core::types::{SynthesisFormat, SynthesizedAudio, TokenUsage, TranscriptionResult};

use crate::run::{ResponseStatus, RunReport};

/// Result of a voice round trip or a voice-to-text query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceAnswer {
    pub question: String,
    pub answer: String,
    /// Base64 speech, `null` for the text-only variant.
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<SynthesisFormat>,
    pub documents_found: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub speech: Option<SynthesizedAudio>,
}

impl VoiceAnswer {
    pub fn new(question: String, answer: String, documents_found: usize) -> Self {
        Self {
            question,
            answer,
            audio: None,
            audio_format: None,
            documents_found,
            timestamp: Utc::now(),
            speech: None,
        }
    }

    pub fn with_speech(mut self, speech: SynthesizedAudio) -> Self {
        self.audio = Some(base64::engine::general_purpose::STANDARD.encode(&speech.bytes));
        self.audio_format = Some(speech.format);
        self.speech = Some(speech);
        self
    }
}

impl ResponseStatus for VoiceAnswer {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTiming {
    pub search_time: u64,
    pub completion_time: u64,
    pub total_time: u64,
}

/// Result of a typed question.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextAnswer {
    pub answer: String,
    pub documents_found: usize,
    pub timing: QueryTiming,
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ResponseStatus for TextAnswer {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResponse {
    pub text: String,
    pub confidence: f32,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&TranscriptionResult> for TranscriptionResponse {
    fn from(result: &TranscriptionResult) -> Self {
        Self {
            text: result.text.clone(),
            confidence: result.confidence,
            duration: result.duration_secs,
            message: result.message.clone(),
        }
    }
}

impl ResponseStatus for TranscriptionResponse {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResponse {
    pub audio_base64: String,
    pub format: SynthesisFormat,
    pub duration: f64,
    pub voice_used: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl From<SynthesizedAudio> for SynthesisResponse {
    fn from(audio: SynthesizedAudio) -> Self {
        Self {
            audio_base64: base64::engine::general_purpose::STANDARD.encode(&audio.bytes),
            format: audio.format,
            duration: audio.duration_secs,
            voice_used: audio.voice,
            bytes: audio.bytes,
        }
    }
}

impl SynthesisResponse {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

impl ResponseStatus for SynthesisResponse {}

pub const NO_SPEECH_ERROR: &str = "No speech detected";
pub const NO_SPEECH_DETAIL: &str = "Could not detect any speech in the audio file";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoSpeechBody {
    pub error: String,
    pub message: String,
    pub transcription: TranscriptionResponse,
}

/// A voice run either answers or stops because nobody spoke.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum VoiceOutcome<T> {
    Answered(T),
    NoSpeech(NoSpeechBody),
}

impl<T> VoiceOutcome<T> {
    pub fn no_speech(transcription: &TranscriptionResult) -> Self {
        Self::NoSpeech(NoSpeechBody {
            error: NO_SPEECH_ERROR.to_string(),
            message: NO_SPEECH_DETAIL.to_string(),
            transcription: transcription.into(),
        })
    }

    pub fn answered(&self) -> Option<&T> {
        match self {
            Self::Answered(answer) => Some(answer),
            Self::NoSpeech(_) => None,
        }
    }
}

impl<T> ResponseStatus for VoiceOutcome<T> {
    fn http_status(&self) -> u16 {
        match self {
            Self::Answered(_) => 200,
            Self::NoSpeech(_) => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub code: String,
}

impl From<&PipelineError> for ErrorBody {
    fn from(err: &PipelineError) -> Self {
        let title = match err {
            PipelineError::Input(_) => "Invalid request",
            PipelineError::Conversion(_) => "Audio conversion failed",
            PipelineError::Recognition(_) => "Speech recognition failed",
            PipelineError::ProviderAuth { .. } => "Authentication failed",
            PipelineError::ProviderRateLimited { .. } => "Rate limit exceeded",
            PipelineError::ProviderTimeout { .. } => "Request timeout",
            PipelineError::RetrievalUnavailable(_) => "Search service unavailable",
            PipelineError::Generation(_) => "Failed to generate response",
            PipelineError::Synthesis(_) => "Speech synthesis failed",
            _ => "Voice query processing failed",
        };
        Self {
            error: title.to_string(),
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

impl<T: Serialize> RunReport<T> {
    /// The JSON body a caller sees for this run, success or failure.
    pub fn body(&self) -> serde_json::Value {
        let value = match &self.result {
            Ok(body) => serde_json::to_value(body),
            Err(err) => serde_json::to_value(ErrorBody::from(err)),
        };
        value.unwrap_or_else(|e| {
            serde_json::json!({
                "error": "Voice query processing failed",
                "message": e.to_string(),
                "code": "PROCESSING_ERROR",
            })
        })
    }
}
