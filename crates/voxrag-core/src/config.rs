//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::types::{GenerationOptions, QueryType, SearchMode, SearchOptions, SynthesisFormat};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;
pub const DEFAULT_VOICE: &str = "en-US-JennyNeural";

/// Top-level voxrag configuration.
///
/// Every section is optional; accessors fall back to defaults and, for the
/// Azure services, to the conventional environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Recognizer backend: "azure" (default) or "whisper".
    #[serde(default = "default_recognizer")]
    pub recognizer: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Recognition language (default: "en-US").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_silence_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_silence_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub whisper: Option<WhisperConfig>,
}

fn default_recognizer() -> String {
    "azure".into()
}

/// OpenAI-compatible transcription endpoint (Groq or OpenAI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    /// Provider: "groq" or "openai" (default: "groq").
    #[serde(default = "default_whisper_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Overrides the provider's default URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_whisper_provider() -> String {
    "groq".into()
}

impl WhisperConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        let fallback_env = match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY",
            _ => "GROQ_API_KEY",
        };
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_secret_field(&None, &Some(fallback_env.into())))
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(match self.provider.as_str() {
            "openai" => "whisper-1",
            _ => "whisper-large-v3-turbo",
        })
    }
}

/// Speech synthesis configuration. Region and key default to the speech section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Default voice (default: "en-US-JennyNeural").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(default)]
    pub format: SynthesisFormat,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Search index configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,

    #[serde(default)]
    pub search_mode: SearchMode,

    #[serde(default)]
    pub query_type: QueryType,

    /// Comma-separated field list passed through as `select`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Chat completion configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// API style: "azure" (default) or "openai".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Azure deployment name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,

    /// Model id for OpenAI-compatible endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Character budget for the retrieved context block (default: 12,000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_chars: Option<usize>,
}

/// Local media handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Scratch directory for per-run temp files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,

    /// ffmpeg binary (default: "ffmpeg" on PATH).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxrag_pipeline=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Direct value, then the configured env var, then a conventional env var.
fn resolve_with_default_env(
    direct: Option<&String>,
    env_var: Option<&String>,
    default_env: &str,
) -> Option<String> {
    let env = env_var.cloned().unwrap_or_else(|| default_env.to_string());
    resolve_secret_field(&direct.cloned(), &Some(env))
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config =
            json5::from_str(&substituted).map_err(|e| PipelineError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    // --- speech ---

    pub fn recognizer(&self) -> &str {
        self.speech
            .as_ref()
            .map(|s| s.recognizer.as_str())
            .unwrap_or("azure")
    }

    pub fn speech_region(&self) -> Option<String> {
        let s = self.speech.as_ref();
        resolve_with_default_env(
            s.and_then(|s| s.region.as_ref()),
            None,
            "AZURE_SPEECH_REGION",
        )
    }

    pub fn speech_key(&self) -> Option<String> {
        let s = self.speech.as_ref();
        resolve_with_default_env(
            s.and_then(|s| s.api_key.as_ref()),
            s.and_then(|s| s.api_key_env.as_ref()),
            "AZURE_SPEECH_KEY",
        )
    }

    pub fn speech_language(&self) -> String {
        self.speech
            .as_ref()
            .and_then(|s| s.language.clone())
            .unwrap_or_else(|| "en-US".to_string())
    }

    pub fn initial_silence_timeout(&self) -> Duration {
        Duration::from_millis(
            self.speech
                .as_ref()
                .and_then(|s| s.initial_silence_timeout_ms)
                .unwrap_or(8000),
        )
    }

    pub fn end_silence_timeout(&self) -> Duration {
        Duration::from_millis(
            self.speech
                .as_ref()
                .and_then(|s| s.end_silence_timeout_ms)
                .unwrap_or(3000),
        )
    }

    /// Whisper settings, with a Groq default when the section is absent.
    pub fn whisper(&self) -> WhisperConfig {
        self.speech
            .as_ref()
            .and_then(|s| s.whisper.clone())
            .unwrap_or(WhisperConfig {
                provider: default_whisper_provider(),
                api_key: None,
                api_key_env: None,
                model: None,
                base_url: None,
            })
    }

    // --- synthesis ---

    pub fn synthesis_region(&self) -> Option<String> {
        self.synthesis
            .as_ref()
            .and_then(|s| s.region.clone())
            .filter(|r| !r.is_empty())
            .or_else(|| self.speech_region())
    }

    pub fn synthesis_key(&self) -> Option<String> {
        self.synthesis
            .as_ref()
            .and_then(|s| resolve_secret_field(&s.api_key, &s.api_key_env))
            .or_else(|| self.speech_key())
    }

    pub fn default_voice(&self) -> String {
        self.synthesis
            .as_ref()
            .and_then(|s| s.voice.clone())
            .unwrap_or_else(|| DEFAULT_VOICE.to_string())
    }

    pub fn synthesis_format(&self) -> SynthesisFormat {
        self.synthesis.as_ref().map(|s| s.format).unwrap_or_default()
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(
            self.synthesis
                .as_ref()
                .and_then(|s| s.timeout_secs)
                .unwrap_or(60),
        )
    }

    // --- search ---

    pub fn search_endpoint(&self) -> Option<String> {
        let s = self.search.as_ref();
        resolve_with_default_env(
            s.and_then(|s| s.endpoint.as_ref()),
            None,
            "AZURE_SEARCH_ENDPOINT",
        )
    }

    pub fn search_key(&self) -> Option<String> {
        let s = self.search.as_ref();
        resolve_with_default_env(
            s.and_then(|s| s.api_key.as_ref()),
            s.and_then(|s| s.api_key_env.as_ref()),
            "AZURE_SEARCH_API_KEY",
        )
    }

    pub fn search_index(&self) -> Option<String> {
        let s = self.search.as_ref();
        resolve_with_default_env(
            s.and_then(|s| s.index.as_ref()),
            None,
            "AZURE_SEARCH_INDEX_NAME",
        )
    }

    pub fn search_options(&self) -> SearchOptions {
        let defaults = SearchOptions::default();
        match &self.search {
            Some(s) => SearchOptions {
                top_k: s.top_k.unwrap_or(defaults.top_k),
                search_mode: s.search_mode,
                query_type: s.query_type,
                select: s.select.clone(),
                filter: None,
            },
            None => defaults,
        }
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search.as_ref().and_then(|s| s.timeout_secs).unwrap_or(30))
    }

    // --- completion ---

    pub fn completion_style(&self) -> &str {
        self.completion
            .as_ref()
            .and_then(|c| c.style.as_deref())
            .unwrap_or("azure")
    }

    pub fn completion_endpoint(&self) -> Option<String> {
        let c = self.completion.as_ref();
        resolve_with_default_env(
            c.and_then(|c| c.endpoint.as_ref()),
            None,
            "AZURE_OPENAI_ENDPOINT",
        )
    }

    pub fn completion_key(&self) -> Option<String> {
        let c = self.completion.as_ref();
        let default_env = match self.completion_style() {
            "openai" => "OPENAI_API_KEY",
            _ => "AZURE_OPENAI_API_KEY",
        };
        resolve_with_default_env(
            c.and_then(|c| c.api_key.as_ref()),
            c.and_then(|c| c.api_key_env.as_ref()),
            default_env,
        )
    }

    pub fn completion_deployment(&self) -> Option<String> {
        let c = self.completion.as_ref();
        resolve_with_default_env(
            c.and_then(|c| c.deployment.as_ref()),
            None,
            "AZURE_OPENAI_DEPLOYMENT",
        )
    }

    pub fn completion_model(&self) -> String {
        self.completion
            .as_ref()
            .and_then(|c| c.model.clone())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn generation_options(&self) -> GenerationOptions {
        let defaults = GenerationOptions::default();
        match &self.completion {
            Some(c) => GenerationOptions {
                temperature: c.temperature.unwrap_or(defaults.temperature),
                max_tokens: c.max_tokens.unwrap_or(defaults.max_tokens),
            },
            None => defaults,
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(
            self.completion
                .as_ref()
                .and_then(|c| c.timeout_secs)
                .unwrap_or(60),
        )
    }

    pub fn max_context_chars(&self) -> usize {
        self.completion
            .as_ref()
            .and_then(|c| c.max_context_chars)
            .unwrap_or(12_000)
    }

    // --- media ---

    pub fn temp_dir(&self) -> PathBuf {
        self.media
            .as_ref()
            .and_then(|m| m.temp_dir.as_ref())
            .map(|d| {
                let expanded = shellexpand::tilde(d);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(crate::temp::default_temp_dir)
    }

    pub fn ffmpeg_path(&self) -> String {
        self.media
            .as_ref()
            .and_then(|m| m.ffmpeg_path.clone())
            .unwrap_or_else(|| "ffmpeg".to_string())
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(
            self.media
                .as_ref()
                .and_then(|m| m.conversion_timeout_secs)
                .unwrap_or(60),
        )
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.media
            .as_ref()
            .and_then(|m| m.max_upload_bytes)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES)
    }

    /// Get a config value by dotted path (e.g. "search.top_k").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match self.recognizer() {
            "azure" => {
                if self.speech_key().is_none() {
                    warnings.push("Speech service has no API key configured".to_string());
                }
                if self.speech_region().is_none() {
                    warnings.push("Speech service has no region configured".to_string());
                }
            }
            "whisper" => {
                if self.whisper().resolve_api_key().is_none() {
                    warnings.push("Whisper recognizer has no API key configured".to_string());
                }
            }
            other => errors.push(format!("Unknown recognizer '{other}' (expected azure or whisper)")),
        }

        if self.search_endpoint().is_none() || self.search_index().is_none() {
            warnings.push(
                "Search endpoint or index not configured; answers will use general knowledge"
                    .to_string(),
            );
        } else if self.search_key().is_none() {
            warnings.push("Search service has no API key configured".to_string());
        }

        match self.completion_style() {
            "azure" => {
                if self.completion_endpoint().is_none() {
                    errors.push("Completion endpoint is not configured".to_string());
                }
                if self.completion_deployment().is_none() {
                    errors.push("Azure completion style requires a deployment".to_string());
                }
            }
            "openai" => {}
            other => errors.push(format!("Unknown completion style '{other}' (expected azure or openai)")),
        }
        if self.completion_key().is_none() {
            warnings.push("Completion service has no API key configured".to_string());
        }

        let opts = self.generation_options();
        if !(0.0..=2.0).contains(&opts.temperature) {
            errors.push(format!("Temperature {} is outside 0.0..=2.0", opts.temperature));
        }
        if opts.max_tokens == 0 {
            errors.push("max_tokens cannot be 0".to_string());
        }
        if self.search_options().top_k == 0 {
            errors.push("search.top_k cannot be 0".to_string());
        }
        if self.max_upload_bytes() == 0 {
            errors.push("media.max_upload_bytes cannot be 0".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for voxrag data: `~/.voxrag/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxrag")
}
