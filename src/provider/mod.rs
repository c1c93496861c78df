pub mod anthropic;
#[cfg(feature = "google")]
pub mod google;
pub mod ollama;
pub mod openai;
mod types;

pub use types::*;

use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::framing::{Framing, ObjectSplit, RawFrame};
use crate::transport::HttpCall;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    Google,
}

impl Backend {
    pub const ALL: [Backend; 4] = [Backend::Anthropic, Backend::OpenAi, Backend::Ollama, Backend::Google];

    pub fn name(self) -> &'static str {
        match self {
            Backend::Anthropic => "anthropic",
            Backend::OpenAi => "openai",
            Backend::Ollama => "ollama",
            Backend::Google => "google",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Backend::Anthropic => "https://api.anthropic.com/",
            Backend::OpenAi => "https://api.openai.com/",
            Backend::Ollama => "http://localhost:11434/",
            Backend::Google => "https://generativelanguage.googleapis.com/",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Backend::Anthropic => "claude-3-5-sonnet-latest",
            Backend::OpenAi => "gpt-4o-mini",
            Backend::Ollama => "deepseek-coder:6.7b",
            Backend::Google => "gemini-1.5-flash",
        }
    }

    pub fn default_timeout(self) -> Duration {
        DEFAULT_REQUEST_TIMEOUT
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|b| b.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown backend: {s}"))
    }
}

/// Static credential attached to every request.
#[derive(Clone)]
pub enum Credential {
    ApiKey(String),
    BearerToken(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(..)"),
            Credential::BearerToken(_) => f.write_str("BearerToken(..)"),
        }
    }
}

/// Raw-mode fill-in-the-middle prompt layouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FimTemplate {
    #[default]
    DeepSeek,
    CodeLlama,
    StarCoder,
}

impl FimTemplate {
    pub fn render(self, prefix: &str, suffix: &str) -> String {
        match self {
            FimTemplate::DeepSeek => {
                format!("<｜fim▁begin｜>{prefix}<｜fim▁hole｜>{suffix}<｜fim▁end｜>")
            }
            FimTemplate::CodeLlama => format!("<PRE> {prefix} <SUF>{suffix} <MID>"),
            FimTemplate::StarCoder => format!("<fim_prefix>{prefix}<fim_suffix>{suffix}<fim_middle>"),
        }
    }

    pub fn stop_sequences(self) -> Vec<String> {
        let stops: &[&str] = match self {
            FimTemplate::DeepSeek => &["<｜fim▁begin｜>", "<｜fim▁hole｜>", "<｜fim▁end｜>", "<｜end▁of▁sentence｜>"],
            FimTemplate::CodeLlama => &["<EOT>", "<PRE>", "<SUF>", "<MID>"],
            FimTemplate::StarCoder => &["<|endoftext|>", "<fim_prefix>", "<fim_suffix>", "<fim_middle>"],
        };
        stops.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: Url,
    pub credential: Option<Credential>,
    pub timeout: Duration,
    pub fim: FimTemplate,
    pub object_split: ObjectSplit,
}

impl ProviderSettings {
    pub fn for_backend(backend: Backend) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: Url::parse(backend.default_base_url())?,
            credential: None,
            timeout: backend.default_timeout(),
            fim: FimTemplate::default(),
            object_split: ObjectSplit::default(),
        })
    }

    pub fn with_base_url(mut self, base: &str) -> anyhow::Result<Self> {
        self.base_url = parse_base_url(base)?;
        Ok(self)
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Parse a base URL so that relative joins append to its path.
pub fn parse_base_url(base: &str) -> anyhow::Result<Url> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).with_context(|| format!("invalid base URL: {base}"))
}

/// Backend adapter contract: request building and frame decoding. Adapters
/// are stateless; the transport and the session carry everything else.
pub trait Provider: Send + Sync {
    fn backend(&self) -> Backend;

    fn timeout(&self) -> Duration;

    fn framing(&self) -> Framing {
        Framing::EventStream
    }

    /// False for backends that thread a continuation token instead.
    fn replays_history(&self) -> bool {
        true
    }

    /// Extra stop sequences for code completion.
    fn fill_stop_sequences(&self) -> Vec<String> {
        Vec::new()
    }

    fn build_call(&self, req: &GenerationRequest) -> anyhow::Result<HttpCall>;

    fn decode(&self, frame: &RawFrame) -> Vec<TextDelta>;

    /// Project a non-streaming response body to its full text.
    fn extract_text(&self, body: &[u8]) -> anyhow::Result<String>;
}

/// Closed set of backends, resolved once when a client is built.
#[derive(Debug, Clone)]
pub enum Adapter {
    Anthropic(anthropic::AnthropicProvider),
    OpenAi(openai::OpenAiProvider),
    Ollama(ollama::OllamaProvider),
    #[cfg(feature = "google")]
    Google(google::GoogleProvider),
}

impl Adapter {
    pub fn new(backend: Backend, settings: ProviderSettings) -> anyhow::Result<Self> {
        Ok(match backend {
            Backend::Anthropic => Adapter::Anthropic(anthropic::AnthropicProvider::new(settings)?),
            Backend::OpenAi => Adapter::OpenAi(openai::OpenAiProvider::new(settings)?),
            Backend::Ollama => Adapter::Ollama(ollama::OllamaProvider::new(settings)),
            Backend::Google => {
                #[cfg(feature = "google")]
                {
                    Adapter::Google(google::GoogleProvider::new(settings)?)
                }
                #[cfg(not(feature = "google"))]
                {
                    let _ = settings;
                    anyhow::bail!("google backend is not enabled in this build")
                }
            }
        })
    }

    pub fn provider(&self) -> &dyn Provider {
        match self {
            Adapter::Anthropic(p) => p,
            Adapter::OpenAi(p) => p,
            Adapter::Ollama(p) => p,
            #[cfg(feature = "google")]
            Adapter::Google(p) => p,
        }
    }

    pub fn backend(&self) -> Backend {
        self.provider().backend()
    }
}

pub(crate) fn json_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    h
}

pub(crate) fn insert_header(h: &mut HeaderMap, name: &'static str, value: &str) -> anyhow::Result<()> {
    let value = HeaderValue::from_str(value).map_err(|e| anyhow!(e).context(format!("invalid {name} header")))?;
    h.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Code-completion prompt for chat-only backends that have no raw mode.
pub(crate) fn fill_instruction(prefix: &str, suffix: &str) -> String {
    format!(
        "Complete the code at <|cursor|>. Reply with only the code that belongs at the cursor, \
         without markdown fences or explanation.\n\n{prefix}<|cursor|>{suffix}"
    )
}

pub(crate) fn require_key(settings: &ProviderSettings, backend: Backend) -> anyhow::Result<String> {
    match &settings.credential {
        Some(Credential::ApiKey(k)) | Some(Credential::BearerToken(k)) if !k.trim().is_empty() => Ok(k.clone()),
        _ => Err(anyhow!("no API key configured for the {backend} backend")),
    }
}
