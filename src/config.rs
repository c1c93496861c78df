use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use wingman::{Backend, FimTemplate, HedgeConfig, ObjectSplit};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Backend used when `--backend` is not given.
    pub backend: Option<Backend>,

    /// Chat model for any backend without its own `model`.
    pub model: Option<String>,

    /// Completion model for any backend without its own `code_model`.
    pub code_model: Option<String>,

    pub system_prompt: Option<String>,

    /// Non-system turns kept per session.
    pub history_ceiling: Option<usize>,

    pub anthropic: BackendConfig,
    pub openai: BackendConfig,
    pub ollama: BackendConfig,
    pub google: BackendConfig,

    pub hedge: HedgeSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub code_model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    /// Raw-mode prompt layout (ollama only).
    pub fim: Option<FimTemplate>,
    /// Object boundary strategy (ollama only).
    pub object_split: Option<ObjectSplit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct HedgeSection {
    pub poll_interval_ms: Option<u64>,
    pub deadline_ms: Option<u64>,
    pub min_elapsed_ms: Option<u64>,
    pub min_lines: Option<usize>,
}

impl HedgeSection {
    pub fn apply(&self, base: HedgeConfig) -> HedgeConfig {
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);
        HedgeConfig {
            poll_interval: ms(self.poll_interval_ms, base.poll_interval),
            deadline: ms(self.deadline_ms, base.deadline),
            min_elapsed: ms(self.min_elapsed_ms, base.min_elapsed),
            min_lines: self.min_lines.unwrap_or(base.min_lines),
        }
    }
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    pub fn section(&self, backend: Backend) -> &BackendConfig {
        match backend {
            Backend::Anthropic => &self.anthropic,
            Backend::OpenAi => &self.openai,
            Backend::Ollama => &self.ollama,
            Backend::Google => &self.google,
        }
    }
}
