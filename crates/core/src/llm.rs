//! Completion-model boundary.
//!
//! Model output is untrusted text: `extract_json_payload` finds the JSON
//! object inside it and `parse_model_json` repairs the usual formatting
//! slips before handing it to serde.

use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

#[async_trait]
impl<M: CompletionModel + ?Sized> CompletionModel for std::sync::Arc<M> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        (**self).complete(request).await
    }
}

/// Client for any endpoint speaking `/v1/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleModel {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl OpenAiCompatibleModel {
    pub fn new(
        api_base: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        timeout: Duration,
        api_key: Option<String>,
    ) -> Result<Self, ModelError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base = api_base.into();
        let endpoint = if base.ends_with("/chat/completions") {
            base
        } else {
            format!("{}/chat/completions", base.trim_end_matches('/'))
        };

        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            temperature,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionModel for OpenAiCompatibleModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: self.temperature,
        };

        debug!(model = %self.model, prompt_chars = request.user.len(), "sending completion request");

        let mut http = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(ModelError::EmptyResponse)
    }
}

/// Pulls the JSON object out of a model reply: a ```json fence, any fence,
/// or the span from the first `{` to the last `}`.
pub fn extract_json_payload(text: &str) -> Option<&str> {
    if let Some(inner) = fenced(text, "```json").or_else(|| fenced(text, "```")) {
        if inner.contains('{') {
            return Some(inner.trim());
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn fenced<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    let end = rest.find("```").unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Escapes raw newlines, tabs and carriage returns that appear inside JSON
/// string literals. Structural whitespace is left alone.
pub fn repair_json_strings(json: &str) -> String {
    let mut repaired = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in json.chars() {
        if in_string {
            if escaped {
                escaped = false;
                repaired.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    repaired.push(ch);
                }
                '"' => {
                    in_string = false;
                    repaired.push(ch);
                }
                '\n' => repaired.push_str("\\n"),
                '\t' => repaired.push_str("\\t"),
                '\r' => {}
                other => repaired.push(other),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            repaired.push(ch);
        }
    }

    repaired
}

pub fn parse_model_json<T: DeserializeOwned>(payload: &str) -> Result<T, serde_json::Error> {
    match serde_json::from_str(payload) {
        Ok(value) => Ok(value),
        Err(first_error) => {
            debug!(error = %first_error, "model JSON did not parse, retrying after repair");
            serde_json::from_str(&repair_json_strings(payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::{json, Value};

    #[test]
    fn json_is_found_in_fenced_and_bare_replies() {
        let fenced = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_payload(fenced), Some("{\"a\": 1}"));

        let plain_fence = "```\n{\"b\": 2}\n```";
        assert_eq!(extract_json_payload(plain_fence), Some("{\"b\": 2}"));

        let bare = "Sure. {\"c\": {\"d\": 3}} done";
        assert_eq!(extract_json_payload(bare), Some("{\"c\": {\"d\": 3}}"));

        assert_eq!(extract_json_payload("no json here"), None);
    }

    #[test]
    fn raw_newlines_inside_strings_are_repaired() {
        let broken = "{\"content\": \"line one\nline\ttwo\r\",\n \"n\": 1}";
        assert!(serde_json::from_str::<Value>(broken).is_err());

        let value: Value = parse_model_json(broken).expect("repaired JSON parses");
        assert_eq!(value["content"], "line one\nline\ttwo");
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn escaped_quotes_do_not_confuse_repair() {
        let text = "{\"q\": \"say \\\"hi\\\"\nthen\"}";
        let value: Value = parse_model_json(text).expect("parses");
        assert_eq!(value["q"], "say \"hi\"\nthen");
    }

    #[test]
    fn endpoint_gets_chat_completions_suffix() {
        let model = OpenAiCompatibleModel::new(
            "http://localhost:11434/v1/",
            "llama3",
            0.3,
            Duration::from_secs(5),
            Some(" ".to_string()),
        )
        .expect("client builds");
        assert_eq!(model.endpoint, "http://localhost:11434/v1/chat/completions");
        assert_eq!(model.api_key, None);
    }

    fn model_at(url: &str, api_key: Option<&str>) -> OpenAiCompatibleModel {
        OpenAiCompatibleModel::new(
            format!("{url}/v1"),
            "llama3",
            0.0,
            Duration::from_secs(5),
            api_key.map(str::to_string),
        )
        .expect("client builds")
    }

    #[tokio::test]
    async fn completion_posts_both_messages_and_trims_the_reply() {
        let mut server = Server::new_async().await;
        let chat = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""model":"llama3""#.to_string()),
                Matcher::Regex(r#""role":"system","content":"Extract triples\.""#.to_string()),
                Matcher::Regex(r#""role":"user","content":"ReAct enables tool use\.""#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "choices": [{"message": {"role": "assistant", "content": "  {\"triples\": []}\n"}}]
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let reply = model_at(&server.url(), Some("sk-test"))
            .complete(&CompletionRequest::new("Extract triples.", "ReAct enables tool use."))
            .await
            .expect("completion succeeds");

        assert_eq!(reply, "{\"triples\": []}");
        chat.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_keeps_the_body() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;

        let result = model_at(&server.url(), None)
            .complete(&CompletionRequest::new("system", "user"))
            .await;

        assert!(matches!(
            result,
            Err(ModelError::Status { status: 429, ref body }) if body == "rate limited"
        ));
    }

    #[tokio::test]
    async fn blank_content_is_an_empty_response() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"choices": [{"message": {"content": "   "}}]}).to_string())
            .create_async()
            .await;

        let result = model_at(&server.url(), None)
            .complete(&CompletionRequest::new("system", "user"))
            .await;

        assert!(matches!(result, Err(ModelError::EmptyResponse)));
    }
}
