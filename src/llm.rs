//! Ollama inference client.
//!
//! Stateless request/response completion over HTTP. Failures never reach
//! the caller as errors: `reply` maps them to short French user-facing
//! strings, and the healthcheck only logs.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message, in Ollama wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Timeout for a conversational turn.
const CHAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for the startup liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a local Ollama daemon.
pub struct OllamaClient {
    base_url: String,
    model: String,
    temperature: f64,
    client: Client,
    probe_client: Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: impl Into<String>, temperature: f64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            temperature,
            client: Client::builder()
                .timeout(CHAT_TIMEOUT)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            probe_client: Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Log whether the configured model is available on the daemon.
    ///
    /// Liveness probe only: failure is logged and never fatal.
    pub async fn healthcheck(&self) {
        let url = format!("{}/api/tags", self.base_url);
        let result = async {
            let resp = self.probe_client.get(&url).send().await?;
            resp.error_for_status()?.json::<OllamaTagsResponse>().await
        }
        .await;

        match result {
            Ok(tags) => {
                let known = tags
                    .models
                    .iter()
                    .any(|m| m.name.as_deref() == Some(&self.model) || m.model.as_deref() == Some(&self.model));
                if known {
                    tracing::info!(model = %self.model, "Ollama OK");
                } else {
                    tracing::warn!(
                        model = %self.model,
                        "model not found on Ollama; `ollama pull {}`",
                        self.model
                    );
                }
            }
            Err(error) => {
                tracing::error!(%error, "no response from Ollama");
            }
        }
    }

    /// Send a chat request and return the reply text.
    ///
    /// Any failure is folded into a user-facing French error string; this
    /// never errors out to the message handler.
    pub async fn reply(&self, messages: &[ChatMessage]) -> String {
        let payload = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        let response = match self.client.post(&url).json(&payload).send().await {
            Ok(resp) => resp,
            Err(error) if error.is_timeout() => {
                tracing::warn!(%error, "Ollama chat timed out");
                return "Délai dépassé en interrogeant Ollama.".to_string();
            }
            Err(error) if error.is_connect() => {
                tracing::warn!(%error, "Ollama unreachable");
                return "Impossible de joindre Ollama. Vérifie qu'il tourne.".to_string();
            }
            Err(error) => {
                tracing::warn!(%error, "Ollama request failed");
                return format!("Erreur IA : {error}");
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(400).collect();
            tracing::warn!(status = %status, "Ollama returned an error");
            return format!("Erreur Ollama (HTTP {}) : {excerpt}", status.as_u16());
        }

        match response.json::<OllamaChatResponse>().await {
            Ok(data) => {
                let content = data
                    .message
                    .map(|m| m.content.trim().to_string())
                    .unwrap_or_default();
                if content.is_empty() {
                    "Réponse vide.".to_string()
                } else {
                    content
                }
            }
            Err(error) => {
                tracing::warn!(%error, "invalid Ollama response body");
                format!("Erreur IA : {error}")
            }
        }
    }
}
