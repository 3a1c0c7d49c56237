//! OpenAI-compatible chat-completions OCR engine (DeepSeek-OCR served by vLLM).

use super::{image_mime_type, OcrEngine};
use crate::config::ServiceConfig;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub struct VllmEngine {
    client: Client,
    completions_url: String,
    api_key: Option<String>,
    model: String,
    default_prompt: String,
    max_tokens: u32,
}

impl VllmEngine {
    pub fn new(client: Client, config: &ServiceConfig) -> Self {
        Self {
            client,
            completions_url: format!("{}/chat/completions", config.engine_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            default_prompt: config.default_prompt.clone(),
            max_tokens: config.max_tokens,
        }
    }

    fn build_request(&self, image: &[u8], prompt: Option<&str>) -> ChatCompletionRequest {
        let prompt = prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&self.default_prompt);
        let data_url = format!("data:{};base64,{}", image_mime_type(image), BASE64.encode(image));

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                    ContentPart::Text {
                        text: prompt.to_string(),
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        }
    }
}

#[async_trait::async_trait]
impl OcrEngine for VllmEngine {
    fn name(&self) -> &str {
        "vllm"
    }

    async fn recognize(&self, image: &[u8], prompt: Option<&str>) -> Result<String> {
        let request = self.build_request(image, prompt);
        debug!(
            "VllmEngine: sending {} byte image to {} (model={})",
            image.len(),
            self.completions_url,
            self.model
        );

        let mut builder = self.client.post(&self.completions_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send request to OCR engine")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OCR engine error ({}): {}", status, error_text);
        }

        let response: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse OCR engine response")?;

        extract_text(response)
    }
}

fn extract_text(response: ChatCompletionResponse) -> Result<String> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .context("OCR engine returned no choices")?;

    if let Some(usage) = response.usage {
        debug!(
            "VllmEngine: {} tokens (prompt: {}, completion: {})",
            usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
        );
    }

    Ok(choice.message.content.unwrap_or_default())
}

// ============================================================================
// Request/response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
