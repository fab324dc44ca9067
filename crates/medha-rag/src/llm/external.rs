//! Hosted chat-completions provider (Groq, OpenAI and compatible APIs).

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{ApiProvider, GenerationConfig, LanguageModel, ProviderInfo};
use crate::config::GatewayConfig;
use crate::state::{Message, Role};

pub struct ExternalProvider {
    provider: ApiProvider,
    api_key: String,
    model: String,
    client: Client,
}

impl ExternalProvider {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        if config.provider.requires_api_key() && config.api_key.trim().is_empty() {
            return Err(anyhow!(
                "{} requires an API key (set llm.api_key or the provider's key variable)",
                config.provider.name()
            ));
        }

        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        tracing::info!(
            provider = config.provider.name(),
            model = %config.model,
            timeout_secs = config.timeout_secs,
            "Creating ExternalProvider"
        );

        Ok(Self {
            provider: config.provider.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        })
    }

    fn format_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect()
    }

    fn build_request(&self, messages: &[Message], config: &GenerationConfig) -> serde_json::Value {
        let mut request = json!({
            "model": self.model,
            "messages": Self::format_messages(messages),
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "stream": false
        });
        if !config.stop_sequences.is_empty() {
            request["stop"] = json!(config.stop_sequences);
        }
        if let Some(seed) = config.seed {
            request["seed"] = json!(seed);
        }
        request
    }
}

/// Parse a response body as JSON, returning a clear error if the server returned HTML
/// (e.g. a gateway error page) instead of valid JSON.
pub(crate) fn parse_json_body<T: serde::de::DeserializeOwned>(
    status: StatusCode,
    body: &str,
    endpoint: &str,
) -> Result<T> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(anyhow!(
            "Endpoint {} returned HTML instead of JSON (HTTP {}); the service may be down. \
             Response: {}",
            endpoint,
            status,
            preview
        ));
    }

    serde_json::from_str::<T>(body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        anyhow!(
            "Failed to parse JSON from {} (HTTP {}): {}. Response body: {}",
            endpoint,
            status,
            e,
            preview
        )
    })
}

fn first_choice_content(response: ChatCompletionResponse) -> Result<String> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No choices returned from API"))?;
    Ok(choice.message.content.unwrap_or_default())
}

#[async_trait]
impl LanguageModel for ExternalProvider {
    async fn chat(&self, messages: &[Message], config: &GenerationConfig) -> Result<String> {
        let endpoint = self.provider.chat_endpoint();
        tracing::debug!(
            endpoint = %endpoint,
            model = %self.model,
            message_count = messages.len(),
            temperature = config.temperature,
            "Sending chat completion request"
        );

        let mut request = self
            .client
            .post(&endpoint)
            .json(&self.build_request(messages, config));
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                tracing::error!(endpoint = %endpoint, "Request timed out");
                anyhow!(
                    "Request to {} timed out; check that the endpoint is reachable",
                    endpoint
                )
            } else if e.is_connect() {
                tracing::error!(endpoint = %endpoint, error = %e, "Connection failed");
                anyhow!(
                    "Failed to connect to {}; check network and proxy settings: {}",
                    endpoint,
                    e
                )
            } else {
                tracing::error!(endpoint = %endpoint, error = %e, "Request failed");
                anyhow!("Request to {} failed: {}", endpoint, e)
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;

        if !status.is_success() {
            tracing::error!(
                endpoint = %endpoint,
                status = %status,
                error = %body,
                "API returned error"
            );
            return Err(anyhow!("API error ({}): {}", status, body));
        }

        let parsed: ChatCompletionResponse = parse_json_body(status, &body, &endpoint)?;
        let content = first_choice_content(parsed)?;
        tracing::debug!("API response received, {} chars", content.len());
        Ok(content)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.provider.name().to_string(),
            model: self.model.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    content: Option<String>,
}
