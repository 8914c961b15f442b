use std::time::Instant;

use async_trait::async_trait;
use docpipe::executor::{CapabilityError, Summarizer};
use serde::{Deserialize, Serialize};

const PROMPT: &str = "Summarize the following text in 5-7 bullet points:";

/// Summarizes text with an OpenAI compatible chat completion endpoint.
#[derive(Clone)]
pub struct OpenAiSummarizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
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

impl OpenAiSummarizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Debug for OpenAiSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiSummarizer")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    #[tracing::instrument(skip_all, fields(model = %self.model, chars = text.len()))]
    async fn summarize(&self, text: &str) -> Result<String, CapabilityError> {
        let start = Instant::now();
        let request = ChatRequest {
            model: &self.model,
            messages: [Message {
                role: "user",
                content: format!("{PROMPT}\n\n{text}"),
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                tracing::warn!(%error, "Summarization request failed");
                CapabilityError::Failed(error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, %body, "Summarization API error");
            return Err(CapabilityError::Failed(format!(
                "Summarization API answered {status}"
            )));
        }

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|error| CapabilityError::Failed(error.to_string()))?;
        let summary = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_owned())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| CapabilityError::Failed("No summary returned".to_owned()))?;

        tracing::debug!(duration_ms = start.elapsed().as_millis(), "Summarized text");
        Ok(summary)
    }
}
