use super::{
    json_headers, Backend, ContinuationToken, FimTemplate, GenerationRequest, Prompt, Provider,
    ProviderSettings, Role, TextDelta,
};
use crate::decode::{decode_frame, push_text};
use crate::framing::{Framing, ObjectSplit, RawFrame};
use crate::transport::HttpCall;
use anyhow::Context;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Local Ollama server, `/api/generate`.
///
/// The response body is JSON objects written back to back. Chat context is
/// carried by the opaque `context` array from the final object rather than
/// by re-sending turns.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    api_base: Url,
    timeout: Duration,
    fim: FimTemplate,
    split: ObjectSplit,
}

impl OllamaProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            api_base: settings.base_url,
            timeout: settings.timeout,
            fim: settings.fim,
            split: settings.object_split,
        }
    }

    fn body(&self, req: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": req.model,
            "stream": req.stream,
        });

        match &req.prompt {
            Prompt::Chat(_) => {
                // Only the newest user turn travels; earlier turns live in `context`.
                let last = req.dialogue().iter().rev().find(|t| t.role == Role::User);
                body["prompt"] = json!(last.map(|t| t.content.as_str()).unwrap_or_default());
                if let Some(image) = last.and_then(|t| t.image.as_ref()) {
                    body["images"] = json!([image.data]);
                }
                if let Some(system) = req.system_text() {
                    body["system"] = json!(system);
                }
                if let Some(token) = &req.continuation {
                    body["context"] = token.0.clone();
                }
            }
            Prompt::Fill { prefix, suffix } => {
                body["prompt"] = json!(self.fim.render(prefix, suffix));
                body["raw"] = json!(true);
            }
        }

        let mut options = Map::new();
        if let Some(t) = req.sampling.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(p) = req.sampling.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if let Some(k) = req.sampling.top_k {
            options.insert("top_k".into(), json!(k));
        }
        if let Some(n) = req.sampling.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        if !req.stop.is_empty() {
            options.insert("stop".into(), json!(req.stop));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

impl Provider for OllamaProvider {
    fn backend(&self) -> Backend {
        Backend::Ollama
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn framing(&self) -> Framing {
        Framing::Concatenated(self.split)
    }

    fn replays_history(&self) -> bool {
        false
    }

    fn fill_stop_sequences(&self) -> Vec<String> {
        self.fim.stop_sequences()
    }

    fn build_call(&self, req: &GenerationRequest) -> anyhow::Result<HttpCall> {
        Ok(HttpCall {
            url: self.api_base.join("api/generate")?,
            headers: json_headers(),
            body: self.body(req),
        })
    }

    fn decode(&self, frame: &RawFrame) -> Vec<TextDelta> {
        decode_frame(Backend::Ollama, frame, |chunk: GenerateChunk| {
            let mut out = Vec::new();
            if let Some(error) = chunk.error {
                out.push(TextDelta::Error(format!("Ollama error: {error}")));
                return out;
            }
            push_text(&mut out, chunk.response);
            if chunk.done {
                out.push(TextDelta::Done {
                    continuation: chunk.context.map(ContinuationToken),
                });
            }
            out
        })
    }

    fn extract_text(&self, body: &[u8]) -> anyhow::Result<String> {
        let chunk: GenerateChunk =
            serde_json::from_slice(body).context("failed to parse Ollama response JSON")?;
        Ok(chunk.response.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameReassembler;
    use crate::provider::ConversationTurn;

    fn provider(split: ObjectSplit) -> OllamaProvider {
        let mut settings = ProviderSettings::for_backend(Backend::Ollama).unwrap();
        settings.object_split = split;
        OllamaProvider::new(settings)
    }

    fn decode_all(p: &OllamaProvider, body: &str) -> Vec<TextDelta> {
        let mut r = FrameReassembler::new(p.framing());
        let mut frames = r.push(body.as_bytes());
        frames.extend(r.finish());
        frames.iter().flat_map(|f| p.decode(f)).collect()
    }

    #[test]
    fn decodes_back_to_back_objects_with_either_strategy() {
        let body = "{\"response\":\"ab\",\"done\":false}\n{\"response\":\"cd\",\"done\":true}";
        for split in [ObjectSplit::Junction, ObjectSplit::BraceDepth] {
            let deltas = decode_all(&provider(split), body);
            let texts: Vec<&str> = deltas.iter().filter_map(TextDelta::text).collect();
            assert_eq!(texts, vec!["ab", "cd"], "{split:?}");
            assert_eq!(deltas.last(), Some(&TextDelta::Done { continuation: None }));
        }
    }

    #[test]
    fn final_object_carries_continuation_token() {
        let body = "{\"response\":\"hi\",\"done\":false}\n{\"response\":\"\",\"done\":true,\"context\":[1,2,3]}";
        let deltas = decode_all(&provider(ObjectSplit::Junction), body);
        assert_eq!(
            deltas,
            vec![
                TextDelta::ContentDelta("hi".into()),
                TextDelta::Done {
                    continuation: Some(ContinuationToken(json!([1, 2, 3])))
                },
            ]
        );
    }

    #[test]
    fn malformed_object_is_skipped_and_stream_continues() {
        let body = "{\"response\":\"a\",\"done\":false}\n{\"response\":tru}\n{\"response\":\"b\",\"done\":true}";
        let deltas = decode_all(&provider(ObjectSplit::Junction), body);
        let texts: Vec<&str> = deltas.iter().filter_map(TextDelta::text).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn server_error_object_becomes_error_delta() {
        let deltas = decode_all(&provider(ObjectSplit::BraceDepth), r#"{"error":"model not found"}"#);
        assert_eq!(deltas, vec![TextDelta::Error("Ollama error: model not found".into())]);
    }

    #[test]
    fn chat_sends_latest_turn_and_context() {
        let req = GenerationRequest::chat(
            Backend::Ollama,
            "llama3",
            vec![
                ConversationTurn::system("be brief"),
                ConversationTurn::user("first"),
                ConversationTurn::assistant("reply"),
                ConversationTurn::user("second"),
            ],
        )
        .with_continuation(Some(ContinuationToken(json!([7, 8]))));
        let call = provider(ObjectSplit::Junction).build_call(&req).unwrap();
        assert_eq!(call.url.as_str(), "http://localhost:11434/api/generate");
        assert_eq!(call.body["prompt"], "second");
        assert_eq!(call.body["system"], "be brief");
        assert_eq!(call.body["context"], json!([7, 8]));
        assert!(call.body.get("raw").is_none());
    }

    #[test]
    fn fill_uses_raw_mode_template() {
        let req = GenerationRequest::fill(Backend::Ollama, "deepseek-coder", "fn main() {", "}")
            .with_stop(provider(ObjectSplit::Junction).fill_stop_sequences());
        let call = provider(ObjectSplit::Junction).build_call(&req).unwrap();
        assert_eq!(call.body["raw"], true);
        assert_eq!(
            call.body["prompt"],
            "<｜fim▁begin｜>fn main() {<｜fim▁hole｜>}<｜fim▁end｜>"
        );
        assert!(call.body["options"]["stop"].as_array().unwrap().len() >= 3);
    }

    #[test]
    fn extracts_non_streaming_response() {
        let p = provider(ObjectSplit::Junction);
        assert_eq!(p.extract_text(br#"{"response":"full","done":true}"#).unwrap(), "full");
    }
}
