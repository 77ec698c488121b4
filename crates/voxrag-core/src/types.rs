use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Container formats accepted on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    M4a,
    Aac,
    Ogg,
    Flac,
    Webm,
    Amr,
    #[serde(rename = "3gp")]
    ThreeGp,
    Unknown,
}

/// File extensions accepted on ingest, without the leading dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "m4a", "aac", "ogg", "flac", "webm", "amr", "3gp",
];

impl AudioFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "wav" | "wave" => Self::Wav,
            "mp3" => Self::Mp3,
            "m4a" | "mp4" => Self::M4a,
            "aac" => Self::Aac,
            "ogg" | "oga" | "opus" => Self::Ogg,
            "flac" => Self::Flac,
            "webm" => Self::Webm,
            "amr" => Self::Amr,
            "3gp" | "3gpp" => Self::ThreeGp,
            _ => Self::Unknown,
        }
    }

    pub fn from_mimetype(mime: &str) -> Self {
        // Parameters such as "; codecs=opus" do not change the container.
        let base = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match base.as_str() {
            "audio/wav" | "audio/wave" | "audio/x-wav" => Self::Wav,
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg-3" => Self::Mp3,
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/mp4a-latm" => Self::M4a,
            "audio/aac" | "audio/aacp" | "audio/x-aac" => Self::Aac,
            "audio/ogg" => Self::Ogg,
            "audio/flac" | "audio/x-flac" => Self::Flac,
            "audio/webm" => Self::Webm,
            "audio/amr" => Self::Amr,
            "audio/3gpp" | "audio/3gpp2" => Self::ThreeGp,
            _ => Self::Unknown,
        }
    }

    /// Sniff the container from the first bytes of the file.
    pub fn from_magic(header: &[u8]) -> Self {
        if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE" {
            return Self::Wav;
        }
        if header.starts_with(b"ID3") {
            return Self::Mp3;
        }
        if header.starts_with(b"OggS") {
            return Self::Ogg;
        }
        if header.starts_with(b"fLaC") {
            return Self::Flac;
        }
        if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return Self::Webm;
        }
        if header.starts_with(b"#!AMR") {
            return Self::Amr;
        }
        if header.len() >= 12 && &header[4..8] == b"ftyp" {
            return if header[8..11] == *b"3gp" || header[8..11] == *b"3g2" {
                Self::ThreeGp
            } else {
                Self::M4a
            };
        }
        if header.len() >= 2 && header[0] == 0xFF {
            // ADTS AAC sync word has layer bits 00; MPEG audio frames do not.
            if header[1] & 0xF6 == 0xF0 {
                return Self::Aac;
            }
            if header[1] & 0xE0 == 0xE0 {
                return Self::Mp3;
            }
        }
        Self::Unknown
    }

    /// Detect the container: magic bytes first, then extension, then mimetype.
    pub fn detect(header: &[u8], path: &Path, mimetype: Option<&str>) -> Self {
        let sniffed = Self::from_magic(header);
        if sniffed != Self::Unknown {
            return sniffed;
        }
        let by_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unknown);
        if by_ext != Self::Unknown {
            return by_ext;
        }
        mimetype.map(Self::from_mimetype).unwrap_or(Self::Unknown)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Aac => "aac",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::Webm => "webm",
            Self::Amr => "amr",
            Self::ThreeGp => "3gp",
            Self::Unknown => "bin",
        }
    }
}

/// An uploaded or generated audio blob on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAsset {
    pub path: PathBuf,
    pub mimetype: Option<String>,
    pub size_bytes: u64,
    pub format: AudioFormat,
}

/// Why a recognizer gave up on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    Auth,
    Quota,
    Network,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptionStatus {
    Recognized,
    NoSpeech,
    Canceled {
        reason: CancellationReason,
        details: String,
    },
    Error {
        details: String,
    },
}

/// Outcome of one recognition pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f32,
    pub duration_secs: f64,
    pub status: TranscriptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub const NO_SPEECH_MESSAGE: &str = "No speech detected in audio";

impl TranscriptionResult {
    pub fn recognized(text: impl Into<String>, confidence: f32, duration_secs: f64) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            duration_secs,
            status: TranscriptionStatus::Recognized,
            message: None,
        }
    }

    pub fn no_speech() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            duration_secs: 0.0,
            status: TranscriptionStatus::NoSpeech,
            message: Some(NO_SPEECH_MESSAGE.to_string()),
        }
    }

    pub fn canceled(reason: CancellationReason, details: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            duration_secs: 0.0,
            status: TranscriptionStatus::Canceled {
                reason,
                details: details.into(),
            },
            message: None,
        }
    }

    pub fn error(details: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            duration_secs: 0.0,
            status: TranscriptionStatus::Error {
                details: details.into(),
            },
            message: None,
        }
    }

    /// True when there is no usable text, whatever the status says.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    pub source: String,
    pub score: f64,
}

/// Assembled instruction text sent to the completion model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagPrompt {
    pub query: String,
    /// The `Source:/Content:` block, absent on the general-knowledge path.
    pub context: Option<String>,
    pub text: String,
    /// True when no document made it into the prompt.
    pub fallback: bool,
    pub documents_used: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Completion model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub duration: Duration,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisFormat {
    #[default]
    Mp3,
    Wav,
}

impl SynthesisFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }
}

/// Rendered speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: SynthesisFormat,
    pub duration_secs: f64,
    pub voice: String,
}

/// Per-call voice settings. `None` fields fall back to the provider default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceOptions {
    #[serde(alias = "voiceName", skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
}

pub const DEFAULT_PROSODY: &str = "medium";

impl VoiceOptions {
    pub fn rate_or_default(&self) -> &str {
        self.rate.as_deref().unwrap_or(DEFAULT_PROSODY)
    }

    pub fn pitch_or_default(&self) -> &str {
        self.pitch.as_deref().unwrap_or(DEFAULT_PROSODY)
    }

    pub fn volume_or_default(&self) -> &str {
        self.volume.as_deref().unwrap_or(DEFAULT_PROSODY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 800,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Simple,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub top_k: usize,
    #[serde(default)]
    pub search_mode: SearchMode,
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            search_mode: SearchMode::Any,
            query_type: QueryType::Simple,
            select: None,
            filter: None,
        }
    }
}
