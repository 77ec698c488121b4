//! Text-to-speech through the Azure Speech REST endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use voxrag_core::config::Config;
use voxrag_core::error::{PipelineError, Result};
use voxrag_core::temp::TempResourceManager;
use voxrag_core::types::{SynthesisFormat, SynthesizedAudio, VoiceOptions};

const SERVICE: &str = "speech synthesis";

/// A voice offered by the synthesis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "PascalCase", serialize = "camelCase"))]
pub struct VoiceInfo {
    pub short_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub local_name: Option<String>,
    pub locale: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub voice_type: Option<String>,
}

/// Neural English voices, the set most callers pick from.
pub fn popular_voices(voices: &[VoiceInfo]) -> Vec<VoiceInfo> {
    voices
        .iter()
        .filter(|v| v.locale.starts_with("en-") && v.short_name.contains("Neural"))
        .cloned()
        .collect()
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn default_voice(&self) -> &str;

    /// Speak plain text with the given prosody.
    async fn synthesize(
        &self,
        text: &str,
        options: &VoiceOptions,
        scratch: &TempResourceManager,
    ) -> Result<SynthesizedAudio>;

    /// Speak a complete SSML document as-is.
    async fn synthesize_ssml(
        &self,
        ssml: &str,
        scratch: &TempResourceManager,
    ) -> Result<SynthesizedAudio>;

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>>;
}

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap `text` in a `<speak><voice><prosody>` document.
pub fn build_ssml(text: &str, voice: &str, options: &VoiceOptions) -> String {
    let lang = voice_locale(voice).unwrap_or("en-US");
    format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" xml:lang=\"{lang}\">\
         <voice name=\"{voice}\">\
         <prosody rate=\"{rate}\" pitch=\"{pitch}\" volume=\"{volume}\">{body}</prosody>\
         </voice></speak>",
        lang = escape_xml(lang),
        voice = escape_xml(voice),
        rate = escape_xml(options.rate_or_default()),
        pitch = escape_xml(options.pitch_or_default()),
        volume = escape_xml(options.volume_or_default()),
        body = escape_xml(text),
    )
}

/// "en-US-JennyNeural" -> "en-US"
fn voice_locale(voice: &str) -> Option<&str> {
    let mut dashes = voice.match_indices('-');
    dashes.next()?;
    let (second, _) = dashes.next()?;
    Some(&voice[..second])
}

/// Extract the first `<voice name="...">` from an SSML document.
pub fn voice_in_ssml(ssml: &str) -> Option<String> {
    let start = ssml.find("<voice")?;
    let tag = &ssml[start..];
    let tag = &tag[..tag.find('>')?];
    for quote in ['"', '\''] {
        let needle = format!("name={quote}");
        if let Some(i) = tag.find(&needle) {
            let rest = &tag[i + needle.len()..];
            let end = rest.find(quote)?;
            return Some(rest[..end].to_string());
        }
    }
    None
}

/// Playback length estimate from the encoded size.
pub fn estimate_duration(format: SynthesisFormat, bytes: usize) -> f64 {
    match format {
        // 32 kbit/s CBR
        SynthesisFormat::Mp3 => bytes as f64 / 4000.0,
        // 16 kHz 16-bit mono after the 44-byte RIFF header
        SynthesisFormat::Wav => bytes.saturating_sub(44) as f64 / 32_000.0,
    }
}

fn output_format_header(format: SynthesisFormat) -> &'static str {
    match format {
        SynthesisFormat::Mp3 => "audio-16khz-32kbitrate-mono-mp3",
        SynthesisFormat::Wav => "riff-16khz-16bit-mono-pcm",
    }
}

pub struct AzureSpeechSynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    voice: String,
    format: SynthesisFormat,
}

impl AzureSpeechSynthesizer {
    pub fn new(
        region: &str,
        api_key: impl Into<String>,
        voice: impl Into<String>,
        format: SynthesisFormat,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("https://{region}.tts.speech.microsoft.com"),
            api_key: api_key.into(),
            voice: voice.into(),
            format,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let region = config
            .synthesis_region()
            .ok_or_else(|| PipelineError::Config("Synthesis region is not configured".into()))?;
        let key = config
            .synthesis_key()
            .ok_or_else(|| PipelineError::Config("Synthesis API key is not configured".into()))?;
        Self::new(
            &region,
            key,
            config.default_voice(),
            config.synthesis_format(),
            config.synthesis_timeout(),
        )
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn format(&self) -> SynthesisFormat {
        self.format
    }

    async fn render(
        &self,
        ssml: String,
        voice: String,
        scratch: &TempResourceManager,
    ) -> Result<SynthesizedAudio> {
        let started = Instant::now();
        debug!(voice = %voice, ssml_len = ssml.len(), "tts_request");

        let resp = self
            .client
            .post(format!("{}/cognitiveservices/v1", self.base_url))
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", output_format_header(self.format))
            .header("User-Agent", "voxrag")
            .body(ssml)
            .send()
            .await
            .map_err(|e| {
                PipelineError::from_transport(SERVICE, e.is_timeout(), &e.to_string(), PipelineError::Synthesis)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_provider_status(
                SERVICE,
                status.as_u16(),
                &body,
                PipelineError::Synthesis,
            ));
        }

        let audio = resp.bytes().await.map_err(|e| {
            PipelineError::from_transport(SERVICE, e.is_timeout(), &e.to_string(), PipelineError::Synthesis)
        })?;
        if audio.is_empty() {
            return Err(PipelineError::Synthesis("Service returned no audio".into()));
        }

        // Round-trip through a named scratch file; it stays tracked if a step fails.
        let path = scratch.write("speech", self.format.extension(), &audio).await?;
        let bytes = tokio::fs::read(&path).await?;
        scratch.release(&path).await?;

        let duration_secs = estimate_duration(self.format, bytes.len());
        info!(
            voice = %voice,
            bytes = bytes.len(),
            duration_secs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "synthesis_complete"
        );
        Ok(SynthesizedAudio {
            bytes,
            format: self.format,
            duration_secs,
            voice,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for AzureSpeechSynthesizer {
    fn default_voice(&self) -> &str {
        &self.voice
    }

    async fn synthesize(
        &self,
        text: &str,
        options: &VoiceOptions,
        scratch: &TempResourceManager,
    ) -> Result<SynthesizedAudio> {
        if text.trim().is_empty() {
            return Err(PipelineError::Input("Text is required for synthesis".into()));
        }
        let voice = options.voice.clone().unwrap_or_else(|| self.voice.clone());
        let ssml = build_ssml(text, &voice, options);
        self.render(ssml, voice, scratch).await
    }

    async fn synthesize_ssml(
        &self,
        ssml: &str,
        scratch: &TempResourceManager,
    ) -> Result<SynthesizedAudio> {
        if !ssml.trim_start().starts_with("<speak") {
            return Err(PipelineError::Input("SSML must start with a <speak> element".into()));
        }
        let voice = voice_in_ssml(ssml).unwrap_or_else(|| self.voice.clone());
        self.render(ssml.to_string(), voice, scratch).await
    }

    async fn list_voices(&self) -> Result<Vec<VoiceInfo>> {
        let resp = self
            .client
            .get(format!("{}/cognitiveservices/voices/list", self.base_url))
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| {
                PipelineError::from_transport(SERVICE, e.is_timeout(), &e.to_string(), PipelineError::Synthesis)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "voice_list_failed");
            return Err(PipelineError::from_provider_status(
                SERVICE,
                status.as_u16(),
                &body,
                PipelineError::Synthesis,
            ));
        }

        resp.json::<Vec<VoiceInfo>>()
            .await
            .map_err(|e| PipelineError::Synthesis(format!("Malformed voice list: {e}")))
    }
}
