use serde::{Deserialize, Serialize};

use super::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Base64-encoded image attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// e.g. `image/png`
    pub media_type: String,
    pub data: String,
}

impl ImagePayload {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePayload>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.image = Some(image);
        self
    }
}

/// Opaque backend-issued context that lets a session resume without
/// re-sending its history (Ollama's `context` array).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(pub serde_json::Value);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Role-tagged turns; a leading `System` turn is the persona preamble.
    Chat(Vec<ConversationTurn>),
    /// Code completion around a cursor.
    Fill { prefix: String, suffix: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub backend: Backend,
    pub model: String,
    pub prompt: Prompt,
    pub sampling: SamplingParams,
    pub stop: Vec<String>,
    pub stream: bool,
    pub continuation: Option<ContinuationToken>,
}

impl GenerationRequest {
    pub fn chat(backend: Backend, model: impl Into<String>, turns: Vec<ConversationTurn>) -> Self {
        Self::with_prompt(backend, model, Prompt::Chat(turns))
    }

    pub fn fill(
        backend: Backend,
        model: impl Into<String>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self::with_prompt(
            backend,
            model,
            Prompt::Fill {
                prefix: prefix.into(),
                suffix: suffix.into(),
            },
        )
    }

    fn with_prompt(backend: Backend, model: impl Into<String>, prompt: Prompt) -> Self {
        Self {
            backend,
            model: model.into(),
            prompt,
            sampling: SamplingParams::default(),
            stop: Vec::new(),
            stream: true,
            continuation: None,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_stop(mut self, stop: impl IntoIterator<Item = String>) -> Self {
        self.stop.extend(stop);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_continuation(mut self, token: Option<ContinuationToken>) -> Self {
        self.continuation = token;
        self
    }

    /// The leading system turn's text, if any and non-blank.
    pub fn system_text(&self) -> Option<&str> {
        match &self.prompt {
            Prompt::Chat(turns) => turns
                .first()
                .filter(|t| t.role == Role::System && !t.content.trim().is_empty())
                .map(|t| t.content.as_str()),
            Prompt::Fill { .. } => None,
        }
    }

    /// Turns after the system preamble.
    pub fn dialogue(&self) -> &[ConversationTurn] {
        match &self.prompt {
            Prompt::Chat(turns) => match turns.first() {
                Some(t) if t.role == Role::System => &turns[1..],
                _ => turns,
            },
            Prompt::Fill { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    ContentStart,
    ContentDelta,
    Done,
    Error,
}

/// One decoded increment handed to the caller while a generation streams.
#[derive(Debug, Clone, PartialEq)]
pub enum TextDelta {
    ContentStart(String),
    ContentDelta(String),
    Done {
        continuation: Option<ContinuationToken>,
    },
    Error(String),
}

impl TextDelta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            TextDelta::ContentStart(_) => DeltaKind::ContentStart,
            TextDelta::ContentDelta(_) => DeltaKind::ContentDelta,
            TextDelta::Done { .. } => DeltaKind::Done,
            TextDelta::Error(_) => DeltaKind::Error,
        }
    }

    /// Generated text carried by this delta; `None` for `Done` and `Error`.
    pub fn text(&self) -> Option<&str> {
        match self {
            TextDelta::ContentStart(t) | TextDelta::ContentDelta(t) => Some(t),
            TextDelta::Done { .. } | TextDelta::Error(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TextDelta::Done { .. } | TextDelta::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialogue_skips_system_preamble() {
        let req = GenerationRequest::chat(
            Backend::OpenAi,
            "gpt-4o",
            vec![
                ConversationTurn::system("be terse"),
                ConversationTurn::user("hi"),
            ],
        );
        assert_eq!(req.system_text(), Some("be terse"));
        assert_eq!(req.dialogue().len(), 1);
        assert_eq!(req.dialogue()[0].content, "hi");
    }

    #[test]
    fn blank_system_turn_is_not_sent() {
        let req = GenerationRequest::chat(
            Backend::Anthropic,
            "claude",
            vec![ConversationTurn::system("  "), ConversationTurn::user("hi")],
        );
        assert_eq!(req.system_text(), None);
        assert_eq!(req.dialogue().len(), 1);
    }
}
