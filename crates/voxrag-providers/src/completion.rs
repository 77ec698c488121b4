//! Chat completion for answer generation.
//!
//! Serves Azure OpenAI deployments and any OpenAI-compatible `/v1/chat/completions`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use voxrag_core::config::Config;
use voxrag_core::error::{PipelineError, Result};
use voxrag_core::types::{GeneratedAnswer, GenerationOptions, TokenUsage};

const SERVICE: &str = "completion";
const AZURE_API_VERSION: &str = "2024-02-15-preview";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub const SYSTEM_INSTRUCTION: &str = "You are a helpful and knowledgeable assistant. Provide accurate, concise, and helpful responses based on the context provided.";

/// API style: where the request goes and how it authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    Azure,
    OpenAi,
}

/// Result of a credentials/connectivity probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub healthy: bool,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GeneratedAnswer>;

    async fn health_check(&self) -> ProviderHealth;
}

pub struct ChatCompletionGenerator {
    pub base_url: String,
    pub api_style: ApiStyle,
    /// Azure deployment or OpenAI model id.
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl ChatCompletionGenerator {
    pub fn azure(
        endpoint: &str,
        deployment: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            api_style: ApiStyle::Azure,
            model: deployment.into(),
            api_key: api_key.into(),
            client: build_client(timeout)?,
        })
    }

    pub fn openai(
        base_url: Option<&str>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_style: ApiStyle::OpenAi,
            model: model.into(),
            api_key: api_key.into(),
            client: build_client(timeout)?,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let key = config
            .completion_key()
            .ok_or_else(|| PipelineError::Config("Completion API key is not configured".into()))?;
        match config.completion_style() {
            "azure" => {
                let endpoint = config.completion_endpoint().ok_or_else(|| {
                    PipelineError::Config("Completion endpoint is not configured".into())
                })?;
                let deployment = config.completion_deployment().ok_or_else(|| {
                    PipelineError::Config("Completion deployment is not configured".into())
                })?;
                Self::azure(&endpoint, deployment, key, config.completion_timeout())
            }
            "openai" => Self::openai(
                config.completion_endpoint().as_deref(),
                config.completion_model(),
                key,
                config.completion_timeout(),
            ),
            other => Err(PipelineError::Config(format!(
                "Unknown completion style '{other}'"
            ))),
        }
    }

    fn url(&self) -> String {
        match self.api_style {
            ApiStyle::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={AZURE_API_VERSION}",
                self.base_url, self.model
            ),
            ApiStyle::OpenAi => format!("{}/v1/chat/completions", self.base_url),
        }
    }

    fn request(&self, body: &ChatRequest<'_>) -> reqwest::RequestBuilder {
        let req = self.client.post(self.url()).json(body);
        match self.api_style {
            ApiStyle::Azure => req.header("api-key", &self.api_key),
            ApiStyle::OpenAi => req.header("Authorization", format!("Bearer {}", self.api_key)),
        }
    }

    fn body<'a>(&'a self, prompt: &'a str, options: &GenerationOptions) -> ChatRequest<'a> {
        ChatRequest {
            model: match self.api_style {
                ApiStyle::Azure => None,
                ApiStyle::OpenAi => Some(self.model.as_str()),
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_INSTRUCTION,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::Config(format!("HTTP client: {e}")))
}

fn transport_error(e: reqwest::Error) -> PipelineError {
    PipelineError::from_transport(SERVICE, e.is_timeout(), &e.to_string(), PipelineError::Generation)
}

// --- Request/response types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl AnswerGenerator for ChatCompletionGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GeneratedAnswer> {
        let started = Instant::now();
        debug!(
            model = %self.model,
            prompt_len = prompt.len(),
            max_tokens = options.max_tokens,
            "completion_request"
        );

        let resp = self
            .request(&self.body(prompt, options))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_provider_status(
                SERVICE,
                status.as_u16(),
                &body,
                PipelineError::Generation,
            ));
        }

        let parsed: ChatResponse = resp.json().await.map_err(transport_error)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(PipelineError::Generation(
                "Completion returned an empty answer".into(),
            ));
        }

        let usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: if u.total_tokens > 0 {
                u.total_tokens
            } else {
                u.prompt_tokens + u.completion_tokens
            },
        });
        let duration = started.elapsed();
        info!(
            model = %self.model,
            total_tokens = usage.map(|u| u.total_tokens).unwrap_or(0),
            elapsed_ms = duration.as_millis() as u64,
            "completion_complete"
        );
        Ok(GeneratedAnswer {
            text,
            usage,
            duration,
            model: parsed.model.or_else(|| Some(self.model.clone())),
        })
    }

    async fn health_check(&self) -> ProviderHealth {
        let probe = GenerationOptions {
            temperature: 0.0,
            max_tokens: 10,
        };
        match self.generate("Hello", &probe).await {
            Ok(_) => ProviderHealth {
                healthy: true,
                model: self.model.clone(),
                error: None,
            },
            Err(e) => ProviderHealth {
                healthy: false,
                model: self.model.clone(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AZURE_PATH: &str = "/openai/deployments/gpt-4o/chat/completions";

    fn azure(url: &str) -> ChatCompletionGenerator {
        ChatCompletionGenerator::azure(url, "gpt-4o", "test-aoai-key", Duration::from_secs(5)).unwrap()
    }

    fn ok_body(content: &str) -> String {
        serde_json::json!({
            "model": "gpt-4o-2024-05-13",
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}
        })
        .to_string()
    }

    #[test]
    fn test_urls_per_style() {
        let a = azure("https://my-aoai.openai.azure.com/");
        assert_eq!(
            a.url(),
            "https://my-aoai.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-02-15-preview"
        );
        let o = ChatCompletionGenerator::openai(None, "gpt-4o-mini", "sk", Duration::from_secs(5)).unwrap();
        assert_eq!(o.url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_body_carries_fixed_sampling_params() {
        let g = azure("http://localhost");
        let body = serde_json::to_value(g.body("Q?", &GenerationOptions::default())).unwrap();
        assert_eq!(body["top_p"], 0.95);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["max_tokens"], 800);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], SYSTEM_INSTRUCTION);
        assert_eq!(body["messages"][1]["content"], "Q?");
        assert!(body.get("model").is_none());
    }

    #[tokio::test]
    async fn test_generate_trims_and_reports_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", AZURE_PATH)
            .match_query(mockito::Matcher::UrlEncoded(
                "api-version".into(),
                AZURE_API_VERSION.into(),
            ))
            .match_header("api-key", "test-aoai-key")
            .with_status(200)
            .with_body(ok_body("  Items can be returned within 30 days.\n"))
            .create_async()
            .await;

        let answer = azure(&server.url())
            .generate("prompt", &GenerationOptions::default())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(answer.text, "Items can be returned within 30 days.");
        let usage = answer.usage.unwrap();
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(answer.model.as_deref(), Some("gpt-4o-2024-05-13"));
    }

    #[tokio::test]
    async fn test_openai_style_uses_bearer_and_model() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("Authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"model": "gpt-4o-mini"})))
            .with_status(200)
            .with_body(ok_body("hi"))
            .create_async()
            .await;
        let g = ChatCompletionGenerator::openai(
            Some(&server.url()),
            "gpt-4o-mini",
            "sk-test",
            Duration::from_secs(5),
        )
        .unwrap();
        g.generate("p", &GenerationOptions::default()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases: [(usize, fn(&PipelineError) -> bool); 3] = [
            (429, |e| matches!(e, PipelineError::ProviderRateLimited { .. })),
            (401, |e| matches!(e, PipelineError::ProviderAuth { .. })),
            (500, |e| matches!(e, PipelineError::Generation(_))),
        ];
        for (code, check) in cases {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("POST", AZURE_PATH)
                .match_query(mockito::Matcher::Any)
                .with_status(code)
                .with_body(r#"{"error":{"message":"nope"}}"#)
                .expect(1)
                .create_async()
                .await;
            let err = azure(&server.url())
                .generate("p", &GenerationOptions::default())
                .await
                .unwrap_err();
            // exactly one request: no retries
            mock.assert_async().await;
            assert!(check(&err), "HTTP {code} mapped to {err:?}");
        }
    }

    #[tokio::test]
    async fn test_empty_answer_is_generation_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", AZURE_PATH)
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(ok_body("   "))
            .create_async()
            .await;
        let err = azure(&server.url())
            .generate("p", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Generation(_)));
    }

    #[tokio::test]
    async fn test_health_check_reports_failure() {
        let health = azure("http://127.0.0.1:9").health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.model, "gpt-4o");
        assert!(health.error.is_some());
    }
}
