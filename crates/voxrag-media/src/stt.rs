//! Speech-to-text over a canonical 16 kHz mono waveform.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use voxrag_core::config::{Config, WhisperConfig};
use voxrag_core::error::{PipelineError, Result};
use voxrag_core::temp::TempResourceManager;
use voxrag_core::types::{AudioAsset, CancellationReason, TranscriptionResult};

use crate::normalize::FormatNormalizer;

/// Extra time on top of the silence windows for upload and server processing.
const NETWORK_ALLOWANCE: Duration = Duration::from_secs(10);

/// One recognition pass over a canonical waveform.
///
/// Provider-side failures come back as `Canceled`/`Error` statuses inside the
/// result. `Err` is reserved for local problems such as an unreadable file.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, wav: &AudioAsset) -> Result<TranscriptionResult>;
}

/// Map a non-success HTTP status to a cancellation reason, if it is one.
fn cancellation_for_status(status: u16) -> Option<CancellationReason> {
    match status {
        401 | 403 => Some(CancellationReason::Auth),
        429 => Some(CancellationReason::Quota),
        408 | 504 => Some(CancellationReason::Network),
        _ => None,
    }
}

fn failed_status(status: u16, body: &str) -> TranscriptionResult {
    let details = format!("HTTP {status}: {body}");
    match cancellation_for_status(status) {
        Some(reason) => TranscriptionResult::canceled(reason, details),
        None => TranscriptionResult::error(details),
    }
}

// --- Azure Speech short-audio REST ---

pub struct AzureSpeechRecognizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    language: String,
    initial_silence: Duration,
    end_silence: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureRecognitionResponse {
    recognition_status: String,
    #[serde(default)]
    display_text: Option<String>,
    /// 100-nanosecond ticks.
    #[serde(default)]
    duration: Option<u64>,
    #[serde(rename = "NBest", default)]
    n_best: Vec<AzureNBest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureNBest {
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    display: Option<String>,
}

const TICKS_PER_SECOND: f64 = 10_000_000.0;

impl AzureSpeechRecognizer {
    pub fn new(
        region: &str,
        api_key: impl Into<String>,
        language: impl Into<String>,
        initial_silence: Duration,
        end_silence: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(initial_silence + end_silence + NETWORK_ALLOWANCE)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("https://{region}.stt.speech.microsoft.com"),
            api_key: api_key.into(),
            language: language.into(),
            initial_silence,
            end_silence,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let region = config
            .speech_region()
            .ok_or_else(|| PipelineError::Config("Speech region is not configured".into()))?;
        let key = config
            .speech_key()
            .ok_or_else(|| PipelineError::Config("Speech API key is not configured".into()))?;
        Self::new(
            &region,
            key,
            config.speech_language(),
            config.initial_silence_timeout(),
            config.end_silence_timeout(),
        )
    }

    /// Point at a different host, e.g. a sovereign cloud or a test server.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/speech/recognition/conversation/cognitiveservices/v1",
            self.base_url
        )
    }
}

fn classify_azure(resp: AzureRecognitionResponse) -> TranscriptionResult {
    match resp.recognition_status.as_str() {
        "Success" => {
            let best = resp
                .n_best
                .iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
            let text = resp
                .display_text
                .filter(|t| !t.trim().is_empty())
                .or_else(|| best.and_then(|b| b.display.clone()))
                .unwrap_or_default();
            if text.trim().is_empty() {
                return TranscriptionResult::no_speech();
            }
            let confidence = best.map(|b| b.confidence).unwrap_or(1.0);
            let duration = resp.duration.unwrap_or(0) as f64 / TICKS_PER_SECOND;
            TranscriptionResult::recognized(text.trim(), confidence, duration)
        }
        "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" => TranscriptionResult::no_speech(),
        other => TranscriptionResult::error(format!("Recognition status {other}")),
    }
}

#[async_trait]
impl SpeechRecognizer for AzureSpeechRecognizer {
    fn name(&self) -> &str {
        "azure-speech"
    }

    async fn recognize(&self, wav: &AudioAsset) -> Result<TranscriptionResult> {
        let audio = tokio::fs::read(&wav.path).await?;
        debug!(language = %self.language, bytes = audio.len(), "azure_stt_request");

        let resp = self
            .client
            .post(self.endpoint())
            .query(&[
                ("language", self.language.as_str()),
                ("format", "detailed"),
            ])
            .query(&[
                ("initialSilenceTimeoutMs", self.initial_silence.as_millis() as u64),
                ("endSilenceTimeoutMs", self.end_silence.as_millis() as u64),
            ])
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "audio/wav; codecs=audio/pcm; samplerate=16000")
            .header("Accept", "application/json")
            .body(audio)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, timed_out = e.is_timeout(), "azure_stt_transport_error");
                return Ok(TranscriptionResult::canceled(
                    CancellationReason::Network,
                    e.to_string(),
                ));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Ok(failed_status(status.as_u16(), &body));
        }

        match resp.json::<AzureRecognitionResponse>().await {
            Ok(parsed) => Ok(classify_azure(parsed)),
            Err(e) => Ok(TranscriptionResult::error(format!(
                "Malformed recognition response: {e}"
            ))),
        }
    }
}

// --- Whisper-compatible transcription ---

/// Get the transcription API URL for a given provider.
pub fn provider_url(config: &WhisperConfig) -> String {
    if let Some(base) = &config.base_url {
        return format!("{}/audio/transcriptions", base.trim_end_matches('/'));
    }
    match config.provider.as_str() {
        "openai" => "https://api.openai.com/v1/audio/transcriptions".into(),
        _ => "https://api.groq.com/openai/v1/audio/transcriptions".into(),
    }
}

pub struct WhisperRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperVerboseResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    avg_logprob: f64,
}

impl WhisperRecognizer {
    pub fn new(
        config: &WhisperConfig,
        language: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| PipelineError::Config("No transcription API key configured".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: provider_url(config),
            api_key,
            model: config.model().to_string(),
            language,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        // Whisper wants ISO-639-1 ("en"), not a locale ("en-US").
        let language = config
            .speech_language()
            .split('-')
            .next()
            .map(|l| l.to_ascii_lowercase());
        Self::new(
            &config.whisper(),
            language,
            config.initial_silence_timeout() + config.end_silence_timeout() + NETWORK_ALLOWANCE,
        )
    }
}

fn whisper_confidence(segments: &[WhisperSegment]) -> f32 {
    if segments.is_empty() {
        return 1.0;
    }
    let mean = segments.iter().map(|s| s.avg_logprob.exp()).sum::<f64>() / segments.len() as f64;
    mean.clamp(0.0, 1.0) as f32
}

#[async_trait]
impl SpeechRecognizer for WhisperRecognizer {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn recognize(&self, wav: &AudioAsset) -> Result<TranscriptionResult> {
        let audio = tokio::fs::read(&wav.path).await?;
        debug!(url = %self.url, model = %self.model, wav_bytes = audio.len(), "whisper_request");

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Internal(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", part);
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        let resp = match self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, timed_out = e.is_timeout(), "whisper_transport_error");
                return Ok(TranscriptionResult::canceled(
                    CancellationReason::Network,
                    e.to_string(),
                ));
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Ok(failed_status(status.as_u16(), &body));
        }

        let parsed: WhisperVerboseResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                return Ok(TranscriptionResult::error(format!(
                    "Malformed transcription response: {e}"
                )));
            }
        };

        let text = parsed.text.trim();
        if text.is_empty() {
            return Ok(TranscriptionResult::no_speech());
        }
        Ok(TranscriptionResult::recognized(
            text,
            whisper_confidence(&parsed.segments),
            parsed.duration.unwrap_or(0.0),
        ))
    }
}

/// Build the recognizer named by `speech.recognizer`.
pub fn recognizer_from_config(config: &Config) -> Result<Arc<dyn SpeechRecognizer>> {
    match config.recognizer() {
        "azure" => Ok(Arc::new(AzureSpeechRecognizer::from_config(config)?)),
        "whisper" => Ok(Arc::new(WhisperRecognizer::from_config(config)?)),
        other => Err(PipelineError::Config(format!("Unknown recognizer '{other}'"))),
    }
}

/// Normalize, then recognize.
///
/// The canonical waveform stays tracked by the caller's temp manager; this
/// type never deletes anything.
#[derive(Clone)]
pub struct Transcriber {
    normalizer: FormatNormalizer,
    recognizer: Arc<dyn SpeechRecognizer>,
}

impl Transcriber {
    pub fn new(normalizer: FormatNormalizer, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            normalizer,
            recognizer,
        }
    }

    pub fn recognizer_name(&self) -> &str {
        self.recognizer.name()
    }

    pub async fn transcribe(
        &self,
        asset: &AudioAsset,
        temps: &TempResourceManager,
    ) -> Result<TranscriptionResult> {
        let canonical = self.normalizer.normalize(asset, temps).await?;
        let started = Instant::now();
        let mut result = self.recognizer.recognize(&canonical).await?;
        if result.status == voxrag_core::types::TranscriptionStatus::Recognized && result.is_blank() {
            result = TranscriptionResult::no_speech();
        }
        info!(
            recognizer = self.recognizer.name(),
            status = ?result.status,
            confidence = result.confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transcription_complete"
        );
        Ok(result)
    }
}
