use super::{
    fill_instruction, insert_header, json_headers, require_key, Backend, ConversationTurn,
    GenerationRequest, Prompt, Provider, ProviderSettings, TextDelta,
};
use crate::decode::{decode_frame, push_text};
use crate::framing::RawFrame;
use crate::transport::HttpCall;
use anyhow::Context;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages API over server-sent events.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    api_key: String,
    api_base: Url,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> anyhow::Result<Self> {
        Ok(Self {
            api_key: require_key(&settings, Backend::Anthropic)?,
            api_base: settings.base_url,
            timeout: settings.timeout,
        })
    }

    fn body(&self, req: &GenerationRequest) -> Value {
        let messages: Vec<Value> = match &req.prompt {
            Prompt::Chat(_) => req.dialogue().iter().map(message).collect(),
            Prompt::Fill { prefix, suffix } => {
                vec![json!({ "role": "user", "content": fill_instruction(prefix, suffix) })]
            }
        };

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": req.stream,
        });
        if let Some(system) = req.system_text() {
            body["system"] = json!(system);
        }
        if let Some(t) = req.sampling.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.sampling.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = req.sampling.top_k {
            body["top_k"] = json!(k);
        }
        if !req.stop.is_empty() {
            body["stop_sequences"] = json!(req.stop);
        }
        body
    }
}

fn message(turn: &ConversationTurn) -> Value {
    let content = match &turn.image {
        None => json!(turn.content),
        Some(image) => json!([
            {
                "type": "image",
                "source": { "type": "base64", "media_type": image.media_type, "data": image.data }
            },
            { "type": "text", "text": turn.content }
        ]),
    };
    json!({ "role": turn.role.as_str(), "content": content })
}

impl Provider for AnthropicProvider {
    fn backend(&self) -> Backend {
        Backend::Anthropic
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build_call(&self, req: &GenerationRequest) -> anyhow::Result<HttpCall> {
        let mut headers = json_headers();
        insert_header(&mut headers, "x-api-key", &self.api_key)?;
        insert_header(&mut headers, "anthropic-version", API_VERSION)?;
        Ok(HttpCall {
            url: self.api_base.join("v1/messages")?,
            headers,
            body: self.body(req),
        })
    }

    fn decode(&self, frame: &RawFrame) -> Vec<TextDelta> {
        decode_frame(Backend::Anthropic, frame, |event: StreamEvent| {
            let mut out = Vec::new();
            match event {
                StreamEvent::ContentBlockStart { content_block } => {
                    if let Some(text) = content_block.text.filter(|t| !t.is_empty()) {
                        out.push(TextDelta::ContentStart(text));
                    }
                }
                StreamEvent::ContentBlockDelta { delta } => push_text(&mut out, delta.text),
                StreamEvent::MessageStop => out.push(TextDelta::Done { continuation: None }),
                StreamEvent::Error { error } => {
                    out.push(TextDelta::Error(format!("Anthropic error: {}", error.message)))
                }
                StreamEvent::Other => {}
            }
            out
        })
    }

    fn extract_text(&self, body: &[u8]) -> anyhow::Result<String> {
        let resp: MessageResponse =
            serde_json::from_slice(body).context("failed to parse Anthropic response JSON")?;
        Ok(resp.content.into_iter().filter_map(|b| b.text).collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockStart { content_block: ContentBlock },
    ContentBlockDelta { delta: BlockDelta },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    // `input_json_delta` blocks carry `partial_json` instead; ignored.
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{FrameReassembler, Framing};
    use crate::provider::{Credential, ImagePayload, SamplingParams};

    fn provider() -> AnthropicProvider {
        let settings = ProviderSettings::for_backend(Backend::Anthropic)
            .unwrap()
            .with_credential(Credential::ApiKey("k".into()));
        AnthropicProvider::new(settings).unwrap()
    }

    fn texts(deltas: &[TextDelta]) -> Vec<&str> {
        deltas.iter().filter_map(TextDelta::text).collect()
    }

    #[test]
    fn decodes_hello_world_and_stops_at_done() {
        let body = "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"Hello\"}}\n\n\
                    data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\" world\"}}\n\n\
                    data: [DONE]\n\n";
        let p = provider();
        let mut r = FrameReassembler::new(p.framing());
        let deltas: Vec<TextDelta> = r.push(body.as_bytes()).iter().flat_map(|f| p.decode(f)).collect();

        assert_eq!(texts(&deltas), vec!["Hello", " world"]);
        assert_eq!(deltas.last(), Some(&TextDelta::Done { continuation: None }));
    }

    #[test]
    fn distinguishes_block_start_from_delta() {
        let p = provider();
        let start = p.decode(&RawFrame::data(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":"Hi"}}"#,
        ));
        assert_eq!(start, vec![TextDelta::ContentStart("Hi".into())]);

        let empty_start = p.decode(&RawFrame::data(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        ));
        assert!(empty_start.is_empty());
    }

    #[test]
    fn ignores_bookkeeping_events_and_reports_errors() {
        let p = provider();
        for payload in [
            r#"{"type":"message_start","message":{"id":"m"}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#,
        ] {
            assert!(p.decode(&RawFrame::data(payload)).is_empty(), "{payload}");
        }
        let err = p.decode(&RawFrame::data(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ));
        assert_eq!(err, vec![TextDelta::Error("Anthropic error: Overloaded".into())]);
        assert_eq!(
            p.decode(&RawFrame::data(r#"{"type":"message_stop"}"#)),
            vec![TextDelta::Done { continuation: None }]
        );
    }

    #[test]
    fn malformed_frame_does_not_stop_decoding() {
        let p = provider();
        assert!(p.decode(&RawFrame::data("{\"type\":\"content_block_delta\",")).is_empty());
    }

    #[test]
    fn builds_messages_request() {
        let req = GenerationRequest::chat(
            Backend::Anthropic,
            "claude-3-5-sonnet-latest",
            vec![
                ConversationTurn::system("You are terse."),
                ConversationTurn::user("What is this?").with_image(ImagePayload {
                    media_type: "image/png".into(),
                    data: "AAAA".into(),
                }),
            ],
        )
        .with_sampling(SamplingParams {
            temperature: Some(0.2),
            max_tokens: Some(256),
            ..Default::default()
        })
        .with_stop(["\n\n".to_string()]);

        let call = provider().build_call(&req).unwrap();
        assert_eq!(call.url.as_str(), "https://api.anthropic.com/v1/messages");
        assert_eq!(call.headers["x-api-key"], "k");
        assert_eq!(call.headers["anthropic-version"], API_VERSION);
        assert_eq!(call.body["system"], "You are terse.");
        assert_eq!(call.body["max_tokens"], 256);
        assert_eq!(call.body["stream"], true);
        assert_eq!(call.body["stop_sequences"], json!(["\n\n"]));
        let content = &call.body["messages"][0]["content"];
        assert_eq!(content[0]["source"]["media_type"], "image/png");
        assert_eq!(content[1]["text"], "What is this?");
    }

    #[test]
    fn extracts_non_streaming_text() {
        let body = br#"{"content":[{"type":"text","text":"Hello"},{"type":"text","text":"!"}]}"#;
        assert_eq!(provider().extract_text(body).unwrap(), "Hello!");
    }
}
