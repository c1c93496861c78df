use super::{
    fill_instruction, insert_header, json_headers, Backend, ConversationTurn, Credential,
    GenerationRequest, Prompt, Provider, ProviderSettings, Role, TextDelta,
};
use crate::decode::decode_frame;
use crate::framing::RawFrame;
use crate::transport::HttpCall;
use anyhow::{anyhow, Context};
use reqwest::header::HeaderMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gemini over the Generative Language API, authenticated with an API key.
#[derive(Clone)]
pub struct GoogleProvider {
    api_key: String,
    api_base: Url,
    timeout: Duration,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("api_base", &self.api_base.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GoogleProvider {
    pub fn new(settings: ProviderSettings) -> anyhow::Result<Self> {
        let api_key = match settings.credential {
            Some(Credential::ApiKey(key)) if !key.trim().is_empty() => key,
            Some(Credential::BearerToken(_)) => {
                return Err(anyhow!("the google backend takes an API key, not a bearer token"))
            }
            _ => return Err(anyhow!("no API key configured for the google backend")),
        };
        Ok(Self {
            api_key,
            api_base: settings.base_url,
            timeout: settings.timeout,
        })
    }

    fn build_url(&self, model: &str, stream: bool) -> anyhow::Result<Url> {
        // v1beta:streamGenerateContent supports Server-Sent Events with alt=sse.
        // Docs: https://ai.google.dev/api/rest/v1beta/models/streamGenerateContent
        let method = if stream { "streamGenerateContent" } else { "generateContent" };
        let mut url = self.api_base.join(&format!("v1beta/models/{model}:{method}"))?;

        if stream {
            url.query_pairs_mut().append_pair("alt", "sse");
        }
        Ok(url)
    }

    fn headers(&self) -> anyhow::Result<HeaderMap> {
        let mut h = json_headers();
        insert_header(&mut h, "x-goog-api-key", &self.api_key)?;
        Ok(h)
    }

    fn body(&self, req: &GenerationRequest) -> GenerateContentRequest {
        let contents = match &req.prompt {
            Prompt::Chat(_) => req.dialogue().iter().map(content).collect(),
            Prompt::Fill { prefix, suffix } => vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(fill_instruction(prefix, suffix))],
            }],
        };

        let system_instruction = req.system_text().map(|s| Content {
            role: None,
            parts: vec![Part::text(s.to_string())],
        });

        let s = &req.sampling;
        let generation_config = GenerationConfig {
            temperature: s.temperature,
            top_p: s.top_p,
            top_k: s.top_k,
            max_output_tokens: s.max_tokens,
            stop_sequences: req.stop.iter().take(5).cloned().collect(),
        };

        GenerateContentRequest {
            contents,
            system_instruction,
            generation_config,
        }
    }
}

fn content(turn: &ConversationTurn) -> Content {
    let role = match turn.role {
        Role::Assistant => "model",
        Role::User | Role::System => "user",
    };
    let mut parts = Vec::new();
    if let Some(image) = &turn.image {
        parts.push(Part {
            text: None,
            inline_data: Some(InlineData {
                mime_type: image.media_type.clone(),
                data: image.data.clone(),
            }),
        });
    }
    parts.push(Part::text(turn.content.clone()));
    Content {
        role: Some(role.to_string()),
        parts,
    }
}

impl Provider for GoogleProvider {
    fn backend(&self) -> Backend {
        Backend::Google
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build_call(&self, req: &GenerationRequest) -> anyhow::Result<HttpCall> {
        Ok(HttpCall {
            url: self.build_url(&req.model, req.stream)?,
            headers: self.headers()?,
            body: serde_json::to_value(self.body(req))?,
        })
    }

    fn decode(&self, frame: &RawFrame) -> Vec<TextDelta> {
        decode_frame(Backend::Google, frame, |r: GenerateContentResponse| {
            let mut out = Vec::new();
            if let Some(error) = &r.error {
                out.push(TextDelta::Error(format!("Gemini API error: {}", error.message)));
                return out;
            }
            if let Some(text) = extract_text(&r) {
                out.push(TextDelta::ContentDelta(text));
            }
            // Gemini has no terminal marker; the last chunk names a finish reason.
            if r.candidates.first().is_some_and(|c| c.finish_reason.is_some()) {
                out.push(TextDelta::Done { continuation: None });
            }
            out
        })
    }

    fn extract_text(&self, body: &[u8]) -> anyhow::Result<String> {
        let r: GenerateContentResponse =
            serde_json::from_slice(body).context("failed to parse Gemini response JSON")?;
        if let Some(error) = r.error {
            return Err(anyhow!("Gemini API error: {}", error.message));
        }
        Ok(extract_text(&r).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            inline_data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

fn extract_text(r: &GenerateContentResponse) -> Option<String> {
    // Concatenate all text parts of the first candidate.
    let cand = r.candidates.first()?;
    let content = cand.content.as_ref()?;
    let mut out = String::new();
    for p in &content.parts {
        if let Some(t) = &p.text {
            out.push_str(t);
        }
    }
    if out.is_empty() { None } else { Some(out) }
}
