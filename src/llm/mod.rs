//! Chat completions client
//!
//! Speaks the OpenAI-compatible chat API exposed by DashScope's
//! compatible mode. Transient failures are retried with backoff.

pub mod retry;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, RoleConfig};
use crate::conversation::{ChatMessage, Generator};
use crate::{Error, Result};
use retry::{RetryPolicy, delay_for_attempt, is_recoverable, is_transient, parse_retry_after};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Language model client
pub struct ChatClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<SecretString>,
    max_history: usize,
    retry: RetryPolicy,
}

impl ChatClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &LlmConfig, api_key: Option<SecretString>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key,
            max_history: config.max_history,
            retry: RetryPolicy::with_max_retries(config.max_retries),
        })
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send one chat request, retrying transient failures
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` without a credential, `Error::Generation` if
    /// the service rejects the request or returns no reply
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("DashScope API key required for chat".to_string()))?;

        let request = ChatRequest {
            model: &self.model,
            messages,
        };

        let mut attempt = 0;
        loop {
            let sent = self
                .client
                .post(&self.url)
                .bearer_auth(api_key.expose_secret())
                .json(&request)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) if is_transient(&e) && attempt < self.retry.max_retries => {
                    let delay = delay_for_attempt(&self.retry, attempt, None);
                    tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis(), "chat request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status.is_success() {
                let parsed: ChatResponse = response.json().await?;
                return extract_reply(parsed);
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();

            if is_recoverable(status.as_u16(), &body) && attempt < self.retry.max_retries {
                let delay = delay_for_attempt(&self.retry, attempt, retry_after);
                tracing::warn!(status = %status, attempt, delay_ms = delay.as_millis(), "chat request rejected, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            tracing::error!(status = %status, attempts = attempt + 1, "chat request failed");
            return Err(Error::Generation(format!(
                "{status}: {}",
                error_message(&body)
            )));
        }
    }
}

/// System prompt, the most recent history, then the new utterance
#[must_use]
pub fn build_messages(
    user_text: &str,
    history: &[ChatMessage],
    role: &RoleConfig,
    max_history: usize,
) -> Vec<ChatMessage> {
    let recent = &history[history.len().saturating_sub(max_history)..];

    let mut messages = Vec::with_capacity(recent.len() + 2);
    if !role.system_prompt.is_empty() {
        messages.push(ChatMessage::system(role.system_prompt.clone()));
    }
    messages.extend_from_slice(recent);
    messages.push(ChatMessage::user(user_text));
    messages
}

fn extract_reply(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| Error::Generation("model returned no reply".to_string()))
}

/// Pull the message out of an error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body).map_or_else(|_| body.to_string(), |e| e.error.message)
}

#[async_trait]
impl Generator for ChatClient {
    async fn generate(
        &self,
        user_text: &str,
        history: &[ChatMessage],
        role: &RoleConfig,
    ) -> Result<String> {
        let messages = build_messages(user_text, history, role, self.max_history);
        tracing::debug!(model = %self.model, messages = messages.len(), "requesting reply");
        self.complete(&messages).await
    }
}
