//! Speech-to-text upstream client.

use super::error::UpstreamError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client as HttpClient;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

/// Transcript of one chunk as returned upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
    /// Opaque token spans; carried through to the chunk result untouched.
    #[serde(default)]
    pub segments: Vec<serde_json::Value>,
}

/// Opaque speech-to-text service boundary.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        audio: Bytes,
        filename: &str,
        model: Option<&str>,
    ) -> Result<Transcription, UpstreamError>;
}

/// HTTP implementation speaking the Whisper-style transcription API.
pub struct HttpSpeechToText {
    client: HttpClient,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl HttpSpeechToText {
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

/// MIME hint from a filename extension; the upstream sniffs anyway, so
/// octet-stream is an acceptable fallback.
fn mime_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or_default() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        audio: Bytes,
        filename: &str,
        model: Option<&str>,
    ) -> Result<Transcription, UpstreamError> {
        let model = model.unwrap_or(&self.default_model);
        let url = format!("{}/audio/transcriptions", self.base_url);
        let size = audio.len();

        let file_part = Part::bytes(audio.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))
            .map_err(|e| UpstreamError::terminal(e.to_string()))?;
        let form = Form::new()
            .part("file", file_part)
            .text("model", model.to_string())
            .text("response_format", "verbose_json");

        debug!(
            target: "upstream::transcription",
            url = %url,
            model = %model,
            size,
            "Sending transcription request"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, body));
        }

        let body = response.text().await?;
        let transcription: Transcription = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::terminal(format!("malformed transcription body: {}", e)))?;

        debug!(
            target: "upstream::transcription",
            text_len = transcription.text.len(),
            segments = transcription.segments.len(),
            "Transcription response received"
        );
        Ok(transcription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_hints_cover_common_containers() {
        assert_eq!(mime_for("a.mp3"), "audio/mpeg");
        assert_eq!(mime_for("a.wav"), "audio/wav");
        assert_eq!(mime_for("clip.webm"), "audio/webm");
        assert_eq!(mime_for("mystery.bin"), "application/octet-stream");
        assert_eq!(mime_for("noext"), "application/octet-stream");
    }

    #[test]
    fn transcription_body_parses_with_missing_segments() {
        let t: Transcription = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(t.text, "hello");
        assert!(t.segments.is_empty());
    }
}
