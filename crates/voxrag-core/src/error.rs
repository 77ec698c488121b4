use thiserror::Error;

/// Every failure a pipeline run can end with.
///
/// Stage-local recoverable conditions (an unavailable search index) never
/// reach this type; they are absorbed by the stage that hit them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Audio conversion failed: {0}")]
    Conversion(String),

    #[error("Speech recognition failed: {0}")]
    Recognition(String),

    #[error("Authentication failed for {service}. Please check your API keys.")]
    ProviderAuth { service: String },

    #[error("Rate limit exceeded on {service}. Please try again in a moment.")]
    ProviderRateLimited { service: String },

    #[error("Request to {service} timed out. The service is taking too long to respond.")]
    ProviderTimeout { service: String },

    #[error("Search service unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Answer generation failed: {0}")]
    Generation(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// HTTP status the response layer should use for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Input(_) => 400,
            Self::Conversion(_) | Self::Recognition(_) => 422,
            Self::ProviderAuth { .. } => 401,
            Self::ProviderRateLimited { .. } => 429,
            Self::ProviderTimeout { .. } => 504,
            Self::RetrievalUnavailable(_) | Self::Generation(_) => 503,
            Self::Synthesis(_)
            | Self::Config(_)
            | Self::Internal(_)
            | Self::Io(_)
            | Self::Json(_) => 500,
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Input(_) => "INPUT_ERROR",
            Self::Conversion(_) => "CONVERSION_ERROR",
            Self::Recognition(_) => "RECOGNITION_ERROR",
            Self::ProviderAuth { .. } => "PROVIDER_AUTH_ERROR",
            Self::ProviderRateLimited { .. } => "PROVIDER_RATE_LIMITED",
            Self::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            Self::RetrievalUnavailable(_) => "RETRIEVAL_UNAVAILABLE",
            Self::Generation(_) => "GENERATION_ERROR",
            Self::Synthesis(_) => "SYNTHESIS_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "PROCESSING_ERROR",
        }
    }

    /// Classify an HTTP failure status from a provider into the taxonomy.
    ///
    /// `fallback` builds the error for statuses with no dedicated variant.
    pub fn from_provider_status(
        service: &str,
        status: u16,
        body: &str,
        fallback: fn(String) -> PipelineError,
    ) -> Self {
        match status {
            401 | 403 => Self::ProviderAuth {
                service: service.to_string(),
            },
            429 => Self::ProviderRateLimited {
                service: service.to_string(),
            },
            408 | 504 => Self::ProviderTimeout {
                service: service.to_string(),
            },
            _ => fallback(format!("{service} returned HTTP {status}: {body}")),
        }
    }

    /// Classify a transport-level failure (connect, read, deadline).
    pub fn from_transport(
        service: &str,
        timed_out: bool,
        message: &str,
        fallback: fn(String) -> PipelineError,
    ) -> Self {
        if timed_out {
            Self::ProviderTimeout {
                service: service.to_string(),
            }
        } else {
            fallback(format!("{service} request failed: {message}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
