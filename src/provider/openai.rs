use super::{
    insert_header, json_headers, require_key, Backend, ConversationTurn, GenerationRequest, Prompt,
    Provider, ProviderSettings, TextDelta,
};
use crate::decode::{decode_frame, push_text};
use crate::framing::RawFrame;
use crate::transport::HttpCall;
use anyhow::{anyhow, Context};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// OpenAI-compatible chat and completions endpoints.
///
/// Chat goes to `/v1/chat/completions`; code completion uses the legacy
/// `/v1/completions` endpoint, which accepts a `suffix`.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    api_key: String,
    api_base: Url,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings) -> anyhow::Result<Self> {
        Ok(Self {
            api_key: require_key(&settings, Backend::OpenAi)?,
            api_base: settings.base_url,
            timeout: settings.timeout,
        })
    }

    fn body(&self, req: &GenerationRequest) -> Value {
        let mut body = match &req.prompt {
            Prompt::Chat(turns) => json!({
                "model": req.model,
                "messages": turns
                    .iter()
                    .filter(|t| !t.content.trim().is_empty() || t.image.is_some())
                    .map(message)
                    .collect::<Vec<_>>(),
                "stream": req.stream,
            }),
            Prompt::Fill { prefix, suffix } => json!({
                "model": req.model,
                "prompt": prefix,
                "suffix": suffix,
                "stream": req.stream,
            }),
        };
        if let Some(t) = req.sampling.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.sampling.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(n) = req.sampling.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if !req.stop.is_empty() {
            // The API caps this at four.
            body["stop"] = json!(req.stop.iter().take(4).collect::<Vec<_>>());
        }
        body
    }
}

fn message(turn: &ConversationTurn) -> Value {
    match &turn.image {
        None => json!({ "role": turn.role.as_str(), "content": turn.content }),
        Some(image) => json!({
            "role": turn.role.as_str(),
            "content": [
                { "type": "text", "text": turn.content },
                { "type": "image_url", "image_url": { "url": image.data_url() } }
            ]
        }),
    }
}

impl Provider for OpenAiProvider {
    fn backend(&self) -> Backend {
        Backend::OpenAi
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build_call(&self, req: &GenerationRequest) -> anyhow::Result<HttpCall> {
        let path = match req.prompt {
            Prompt::Chat(_) => "v1/chat/completions",
            Prompt::Fill { .. } => "v1/completions",
        };
        let mut headers = json_headers();
        insert_header(&mut headers, "authorization", &format!("Bearer {}", self.api_key))?;
        Ok(HttpCall {
            url: self.api_base.join(path)?,
            headers,
            body: self.body(req),
        })
    }

    fn decode(&self, frame: &RawFrame) -> Vec<TextDelta> {
        decode_frame(Backend::OpenAi, frame, |chunk: Chunk| {
            let mut out = Vec::new();
            if let Some(error) = chunk.error {
                out.push(TextDelta::Error(format!("OpenAI error: {}", error.message)));
                return out;
            }
            if let Some(choice) = chunk.choices.into_iter().next() {
                let text = choice.delta.and_then(|d| d.content).or(choice.text);
                push_text(&mut out, text);
            }
            out
        })
    }

    fn extract_text(&self, body: &[u8]) -> anyhow::Result<String> {
        let resp: Completion =
            serde_json::from_slice(body).context("failed to parse OpenAI response JSON")?;
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("OpenAI response has no choices"))?;
        Ok(choice.message.and_then(|m| m.content).or(choice.text).unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<Delta>,
    #[serde(default)]
    text: Option<String>,
}
