//! Text-correction upstream client.

use super::error::UpstreamError;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are a transcript editor. Fix spelling, punctuation, \
and obvious transcription mistakes in the user's text. Preserve the original wording \
and meaning. Reply with the corrected text only.";

/// Opaque text-correction service boundary.
#[async_trait]
pub trait TextCorrection: Send + Sync {
    async fn correct(&self, text: &str, model: Option<&str>) -> Result<String, UpstreamError>;
}

/// HTTP implementation speaking the chat-completions API shape.
pub struct HttpTextCorrection {
    client: HttpClient,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl HttpTextCorrection {
    pub fn new(
        client: HttpClient,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl TextCorrection for HttpTextCorrection {
    async fn correct(&self, text: &str, model: Option<&str>) -> Result<String, UpstreamError> {
        let model = model.unwrap_or(&self.default_model);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            target: "upstream::correction",
            url = %url,
            model = %model,
            text_len = text.len(),
            "Sending correction request"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": model,
                "temperature": 0.2,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": text},
                ],
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body));
        }

        let body = response.text().await?;
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::terminal(format!("malformed correction body: {}", e)))?;
        let corrected = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| UpstreamError::terminal("correction response had no choices"))?;

        debug!(
            target: "upstream::correction",
            corrected_len = corrected.len(),
            "Correction response received"
        );
        Ok(corrected)
    }
}
