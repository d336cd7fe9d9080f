//! Anthropic Messages API provider
//!
//! Tools are offered with `tool_choice: any`, so every turn yields a tool
//! call; the final answer is the `submit_analysis` call. When tools are
//! withheld the provider forces `submit_analysis`.

use super::{ReasoningProvider, ReasoningRequest, ReasoningStep, StaticFindings, TranscriptEntry};
use crate::config::truncate;
use crate::error::ReasoningError;
use crate::tools::{submit_analysis_definition, tool_definitions, ToolCall, SUBMIT_ANALYSIS};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic-backed reasoning provider
#[derive(Debug, Clone)]
pub struct AnthropicReasoner {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicReasoner {
    /// Create with an API key and default model
    ///
    /// # Errors
    /// `MissingApiKey` for an empty key, `Unavailable` if the HTTP client
    /// cannot be built
    pub fn new(api_key: impl Into<String>) -> Result<Self, ReasoningError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ReasoningError::MissingApiKey("anthropic"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| ReasoningError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: ANTHROPIC_API_URL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    /// Read `ANTHROPIC_API_KEY`, and `HACKSCAN_MODEL` when set
    ///
    /// # Errors
    /// `MissingApiKey` when the key is unset
    pub fn from_env() -> Result<Self, ReasoningError> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ReasoningError::MissingApiKey("anthropic"))?;
        let reasoner = Self::new(key)?;
        Ok(match std::env::var("HACKSCAN_MODEL") {
            Ok(model) if !model.trim().is_empty() => reasoner.with_model(model),
            _ => reasoner,
        })
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn build_request_body(&self, request: &ReasoningRequest<'_>) -> Value {
        let tools: Vec<Value> = if request.tools_enabled {
            tool_definitions()
                .into_iter()
                .chain(std::iter::once(submit_analysis_definition()))
                .map(|t| json!(t))
                .collect()
        } else {
            vec![json!(submit_analysis_definition())]
        };
        let tool_choice = if request.tools_enabled {
            json!({ "type": "any" })
        } else {
            json!({ "type": "tool", "name": SUBMIT_ANALYSIS })
        };

        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": request.system,
            "messages": build_messages(request.task, request.transcript),
            "tools": tools,
            "tool_choice": tool_choice,
        })
    }
}

/// Transcript to Messages API turns; adjacent blocks of one role are merged
fn build_messages(task: &str, transcript: &[TranscriptEntry]) -> Vec<Value> {
    let mut turns: Vec<(&'static str, Vec<Value>)> =
        vec![("user", vec![json!({ "type": "text", "text": task })])];

    for entry in transcript {
        let (role, block) = match entry {
            TranscriptEntry::ToolUse { id, call } => (
                "assistant",
                json!({ "type": "tool_use", "id": id, "name": call.name(), "input": call.input() }),
            ),
            TranscriptEntry::ToolResult { id, output } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": output.content,
                });
                if output.is_error {
                    block["is_error"] = json!(true);
                }
                ("user", block)
            }
            TranscriptEntry::Correction(text) => ("user", json!({ "type": "text", "text": text })),
        };
        match turns.last_mut() {
            Some((last_role, blocks)) if *last_role == role => blocks.push(block),
            _ => turns.push((role, vec![block])),
        }
    }

    turns
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

fn parse_response(response: MessagesResponse) -> Result<ReasoningStep, ReasoningError> {
    let mut text = String::new();
    for block in response.content {
        match block {
            ContentBlock::ToolUse { name, input, .. } if name == SUBMIT_ANALYSIS => {
                return StaticFindings::from_value(&input).map(ReasoningStep::Final);
            }
            ContentBlock::ToolUse { id, name, input } => {
                let call = ToolCall::from_named(&name, &input)?;
                return Ok(ReasoningStep::ToolUse { id, call });
            }
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::Other => {}
        }
    }

    // some models answer in prose with an embedded JSON object
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            let value: Value = serde_json::from_str(&text[start..=end])
                .map_err(|e| ReasoningError::MalformedResponse(e.to_string()))?;
            StaticFindings::from_value(&value).map(ReasoningStep::Final)
        }
        _ => Err(ReasoningError::MalformedResponse(
            "response contained no tool call".into(),
        )),
    }
}

#[async_trait]
impl ReasoningProvider for AnthropicReasoner {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn next_step(&self, request: ReasoningRequest<'_>) -> Result<ReasoningStep, ReasoningError> {
        let body = self.build_request_body(&request);
        tracing::debug!(
            model = %self.model,
            iteration = request.iteration,
            tools_enabled = request.tools_enabled,
            "sending reasoning request"
        );

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ReasoningError::Unavailable(e.to_string()))?;

        let status = response.status().as_u16();
        let body_text = response
            .text()
            .await
            .map_err(|e| ReasoningError::Unavailable(e.to_string()))?;
        if status != 200 {
            return Err(ReasoningError::Http {
                status,
                body: truncate(&body_text, 500),
            });
        }

        let parsed: MessagesResponse = serde_json::from_str(&body_text)
            .map_err(|e| ReasoningError::MalformedResponse(format!("failed to parse response: {e}")))?;
        parse_response(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutput;
    use crate::types::Sponsor;

    fn parse(value: Value) -> Result<ReasoningStep, ReasoningError> {
        parse_response(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            AnthropicReasoner::new("  "),
            Err(ReasoningError::MissingApiKey(_))
        ));
    }

    #[test]
    fn messages_merge_by_role() {
        let transcript = vec![
            TranscriptEntry::ToolUse {
                id: "t1".into(),
                call: ToolCall::ListDirectory { path: ".".into() },
            },
            TranscriptEntry::ToolResult {
                id: "t1".into(),
                output: ToolOutput { content: "src/".into(), is_error: false },
            },
            TranscriptEntry::Correction("use a known tool".into()),
        ];
        let messages = build_messages("analyze", &transcript);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["name"], "list_directory");
        assert_eq!(messages[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "t1");
    }

    #[test]
    fn forced_final_request_offers_only_submit() {
        let reasoner = AnthropicReasoner::new("key").unwrap();
        let request = ReasoningRequest {
            system: "sys",
            task: "task",
            transcript: &[],
            tools_enabled: false,
            iteration: 26,
        };
        let body = reasoner.build_request_body(&request);
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert_eq!(body["tool_choice"]["name"], SUBMIT_ANALYSIS);
        assert_eq!(body["system"], "sys");
    }

    #[test]
    fn parses_tool_use_and_final() {
        let step = parse(json!({ "content": [
            { "type": "text", "text": "Let me look." },
            { "type": "tool_use", "id": "tu_1", "name": "read_file", "input": { "path": "package.json" } }
        ]}))
        .unwrap();
        assert_eq!(
            step,
            ReasoningStep::ToolUse {
                id: "tu_1".into(),
                call: ToolCall::ReadFile { path: "package.json".into() }
            }
        );

        let step = parse(json!({ "content": [
            { "type": "tool_use", "id": "tu_2", "name": "submit_analysis", "input": {
                "sponsors": { "redis": { "detected": true, "integrationScore": 7, "confidence": 0.6 } },
                "overallSummary": "uses redis"
            }}
        ]}))
        .unwrap();
        let ReasoningStep::Final(findings) = step else {
            panic!("expected final step");
        };
        assert_eq!(findings.sponsors[&Sponsor::Redis].integration_score, 7);
    }

    #[test]
    fn parses_prose_json_and_rejects_plain_text() {
        let step = parse(json!({ "content": [
            { "type": "text", "text": "Result: {\"sponsors\": {}, \"overallSummary\": \"none\"}" }
        ]}))
        .unwrap();
        assert!(matches!(step, ReasoningStep::Final(_)));

        let err = parse(json!({ "content": [{ "type": "text", "text": "thinking..." }] })).unwrap_err();
        assert!(matches!(err, ReasoningError::MalformedResponse(_)));

        let err = parse(json!({ "content": [
            { "type": "tool_use", "id": "x", "name": "delete_repo", "input": {} }
        ]}))
        .unwrap_err();
        assert!(matches!(err, ReasoningError::UnknownTool(_)));
    }
}
