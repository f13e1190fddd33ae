use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the remote extraction service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("rate limited by service: {0}")]
    RateLimited(String),
    #[error("service returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unreadable service response: {0}")]
    InvalidBody(String),
}

/// User turn of a completion call.
#[derive(Debug, Clone, PartialEq)]
pub enum UserPayload {
    /// The report itself, as a base64 data URL.
    Attachment { filename: String, data_url: String },
    /// Text extracted locally from an oversized report.
    Text(String),
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub payload: &'a UserPayload,
    pub instruction: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReply {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A remote model that answers with a single JSON object.
pub trait CompletionClient {
    fn model(&self) -> &str;

    fn complete(&self, request: &CompletionRequest<'_>) -> Result<CompletionReply, ServiceError>;
}

/// Blocking client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
    max_completion_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    File { file: FilePart<'a> },
}

#[derive(Serialize)]
struct FilePart<'a> {
    filename: &'a str,
    file_data: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn user_parts<'a>(request: &CompletionRequest<'a>) -> Vec<ContentPart<'a>> {
    match request.payload {
        UserPayload::Attachment {
            filename,
            data_url,
        } => vec![
            ContentPart::File {
                file: FilePart {
                    filename: filename.as_str(),
                    file_data: data_url.as_str(),
                },
            },
            ContentPart::Text {
                text: request.instruction,
            },
        ],
        UserPayload::Text(text) => vec![
            ContentPart::Text {
                text: text.as_str(),
            },
            ContentPart::Text {
                text: request.instruction,
            },
        ],
    }
}

impl CompletionClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &CompletionRequest<'_>) -> Result<CompletionReply, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(request.system),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(user_parts(request)),
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.1,
            max_completion_tokens: 4000,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().unwrap_or_default();
            return Err(ServiceError::RateLimited(body));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| ServiceError::InvalidBody(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .map(|usage| (usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or((0, 0));

        Ok(CompletionReply {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = OpenAiClient::new(
            "https://api.example.test/v1/",
            "key",
            "gpt-5.2",
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(client.base_url, "https://api.example.test/v1");
        assert_eq!(client.model(), "gpt-5.2");
    }

    #[test]
    fn attachment_payload_serializes_file_part_then_instruction() {
        let payload = UserPayload::Attachment {
            filename: "reporte.pdf".to_string(),
            data_url: "data:application/pdf;base64,QUJD".to_string(),
        };
        let request = CompletionRequest {
            system: "system",
            payload: &payload,
            instruction: "extract",
        };

        let value = serde_json::to_value(user_parts(&request)).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!([
                {
                    "type": "file",
                    "file": {
                        "filename": "reporte.pdf",
                        "file_data": "data:application/pdf;base64,QUJD"
                    }
                },
                { "type": "text", "text": "extract" }
            ])
        );
    }

    #[test]
    fn text_payload_serializes_as_two_text_parts() {
        let payload = UserPayload::Text("report body".to_string());
        let request = CompletionRequest {
            system: "system",
            payload: &payload,
            instruction: "extract",
        };

        let value = serde_json::to_value(user_parts(&request)).expect("serialize");
        assert_eq!(value[0]["text"], "report body");
        assert_eq!(value[1]["text"], "extract");
    }

    #[test]
    fn chat_response_tolerates_missing_usage_and_content() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#)
                .expect("deserialize");
        assert!(parsed.usage.is_none());
        assert!(parsed.choices[0].message.content.is_none());
    }
}
