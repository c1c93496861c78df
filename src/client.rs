use futures_core::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::cancel::{AbortHandle, AbortReason};
use crate::framing::{FrameReassembler, RawFrame};
use crate::hedge::{HedgeConfig, HedgeController, HedgeOutcome};
use crate::history::Session;
use crate::provider::{
    Adapter, Backend, ConversationTurn, GenerationRequest, Provider, SamplingParams, TextDelta,
};
use crate::transport::{AbortableStream, HttpCall, Transport, TransportFailure};

const DELTA_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub model: String,
    /// Model used for hedged code completion.
    pub code_model: String,
    pub sampling: SamplingParams,
    pub code_sampling: SamplingParams,
    pub hedge: HedgeConfig,
}

impl ClientSettings {
    pub fn for_backend(backend: Backend) -> Self {
        Self {
            model: backend.default_model().to_string(),
            code_model: backend.default_model().to_string(),
            sampling: SamplingParams::default(),
            code_sampling: SamplingParams::default(),
            hedge: HedgeConfig::default(),
        }
    }
}

/// Result of a buffered call or a finished chat round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub text: String,
    /// Backend-labeled failure, already logged.
    pub error: Option<String>,
    /// Cancelled or timed out before the backend finished.
    pub aborted: bool,
}

/// One backend, resolved once; cheap to clone and share between calls.
#[derive(Clone)]
pub struct Client {
    adapter: Arc<Adapter>,
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("adapter", &self.adapter)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(adapter: Adapter, transport: Arc<dyn Transport>, settings: ClientSettings) -> Self {
        Self {
            adapter: Arc::new(adapter),
            transport,
            settings,
        }
    }

    pub fn backend(&self) -> Backend {
        self.adapter.backend()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn provider(&self) -> &dyn Provider {
        self.adapter.provider()
    }

    /// Chat request over `turns` with the configured model and sampling.
    pub fn chat_request(&self, turns: Vec<ConversationTurn>) -> GenerationRequest {
        GenerationRequest::chat(self.backend(), self.settings.model.clone(), turns)
            .with_sampling(self.settings.sampling)
    }

    /// Fill-in-the-middle request with the code model and its stop sequences.
    pub fn fill_request(&self, prefix: &str, suffix: &str) -> GenerationRequest {
        GenerationRequest::fill(self.backend(), self.settings.code_model.clone(), prefix, suffix)
            .with_sampling(self.settings.code_sampling)
            .with_stop(self.provider().fill_stop_sequences())
    }

    /// Start a streaming generation.
    ///
    /// The stream ends with exactly one `Done` or `Error` delta, or simply
    /// ends once `cancel` fires or the request times out. Nothing is yielded
    /// after that. Must be called from within a tokio runtime.
    pub fn stream(&self, req: &GenerationRequest, cancel: CancellationToken) -> BoxStream<'static, TextDelta> {
        let (tx, rx) = mpsc::channel(DELTA_BUFFER);
        let mut handle = AbortHandle::link(&cancel, self.provider().timeout());
        let abort = handle.token().clone();
        let call = self.provider().build_call(&req.clone().streaming(true));
        let adapter = Arc::clone(&self.adapter);
        let transport = Arc::clone(&self.transport);

        tokio::spawn(async move {
            let provider = adapter.provider();
            let backend = provider.backend();
            match call {
                _ if handle.is_triggered() => {
                    tracing::debug!(%backend, "cancelled before send");
                }
                Ok(call) => pump(provider, transport.as_ref(), call, handle.token(), &tx).await,
                Err(e) => {
                    tracing::error!(%backend, error = %format!("{e:#}"), "failed to build request");
                    let _ = tx.send(TextDelta::Error(format!("{backend} request failed: {e:#}"))).await;
                }
            }
            if handle.reason() == Some(AbortReason::Timeout) {
                tracing::warn!(%backend, "request timed out");
            }
            handle.release().await;
        });

        Box::pin(AbortableStream::new(ReceiverStream::new(rx), abort))
    }

    /// Non-streaming generation; the whole body is buffered.
    pub async fn complete(&self, req: &GenerationRequest, cancel: &CancellationToken) -> Reply {
        let provider = self.provider();
        let backend = provider.backend();
        let mut handle = AbortHandle::link(cancel, provider.timeout());

        let reply = if handle.is_triggered() {
            tracing::debug!(%backend, "cancelled before send");
            Reply {
                aborted: true,
                ..Reply::default()
            }
        } else {
            match self.fetch_text(req, handle.token()).await {
                Ok(text) => Reply {
                    text,
                    ..Reply::default()
                },
                Err(Fetch::Aborted) => Reply {
                    aborted: true,
                    ..Reply::default()
                },
                Err(Fetch::Failed(msg)) => {
                    tracing::error!(%backend, error = %msg, "request failed");
                    Reply {
                        error: Some(format!("{backend} request failed: {msg}")),
                        ..Reply::default()
                    }
                }
            }
        };

        if handle.reason() == Some(AbortReason::Timeout) {
            tracing::warn!(%backend, "request timed out");
        }
        handle.release().await;
        reply
    }

    async fn fetch_text(&self, req: &GenerationRequest, abort: &CancellationToken) -> Result<String, Fetch> {
        let provider = self.provider();
        let call = provider
            .build_call(&req.clone().streaming(false))
            .map_err(|e| Fetch::Failed(format!("{e:#}")))?;
        let body = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(Fetch::Aborted),
            body = self.transport.fetch(call, abort.clone()) => body.map_err(Fetch::from)?,
        };
        provider.extract_text(&body).map_err(|e| Fetch::Failed(format!("{e:#}")))
    }

    /// One chat round on `session`: append `turn`, stream the reply through
    /// `on_delta`, then record the assistant turn and truncate.
    pub async fn chat<F>(
        &self,
        session: &mut Session,
        turn: ConversationTurn,
        cancel: &CancellationToken,
        mut on_delta: F,
    ) -> Reply
    where
        F: FnMut(&TextDelta),
    {
        session.push_user(turn);

        if cancel.is_cancelled() {
            session.record_reply("", None);
            return Reply {
                aborted: true,
                ..Reply::default()
            };
        }

        let turns = if self.provider().replays_history() {
            session.turns().to_vec()
        } else {
            // Earlier turns live in the continuation token.
            std::iter::once(session.system_turn())
                .chain(session.last_turn())
                .cloned()
                .collect()
        };
        let req = self
            .chat_request(turns)
            .with_continuation(session.continuation().cloned());

        let mut deltas = self.stream(&req, cancel.clone());
        let mut reply = Reply::default();
        let mut continuation = None;
        let mut finished = false;
        while let Some(delta) = deltas.next().await {
            on_delta(&delta);
            match delta {
                TextDelta::ContentStart(text) | TextDelta::ContentDelta(text) => reply.text.push_str(&text),
                TextDelta::Done { continuation: token } => {
                    continuation = token;
                    finished = true;
                }
                TextDelta::Error(e) => {
                    reply.error = Some(e);
                    finished = true;
                }
            }
        }
        reply.aborted = !finished;

        session.record_reply(&reply.text, continuation);
        reply
    }

    /// Hedged code completion at a cursor. The generation runs under a child
    /// of `cancel` and is always stopped before this returns.
    pub async fn complete_code(&self, prefix: &str, suffix: &str, cancel: &CancellationToken) -> HedgeOutcome {
        let req = self.fill_request(prefix, suffix);
        let scope = cancel.child_token();
        let deltas = self.stream(&req, scope.clone());
        HedgeController::new(self.settings.hedge).race(deltas, scope).await
    }
}

enum Fetch {
    Aborted,
    Failed(String),
}

impl From<TransportFailure> for Fetch {
    fn from(e: TransportFailure) -> Self {
        if e.is_aborted() {
            Fetch::Aborted
        } else {
            Fetch::Failed(e.to_string())
        }
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// Drive one response body: bytes → frames → deltas → `tx`.
async fn pump(
    provider: &dyn Provider,
    transport: &dyn Transport,
    call: HttpCall,
    abort: &CancellationToken,
    tx: &mpsc::Sender<TextDelta>,
) {
    let backend = provider.backend();
    let opened = tokio::select! {
        biased;
        _ = abort.cancelled() => Err(TransportFailure::Aborted),
        opened = transport.open_stream(call, abort.clone()) => opened,
    };
    let mut body = match opened {
        Ok(body) => body,
        Err(e) if e.is_aborted() => {
            tracing::debug!(%backend, "aborted before response");
            return;
        }
        Err(e) => {
            tracing::error!(%backend, error = %e, "request failed");
            let _ = tx.send(TextDelta::Error(format!("{backend} request failed: {e}"))).await;
            return;
        }
    };

    let mut reassembler = FrameReassembler::new(provider.framing());
    loop {
        let chunk = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                tracing::debug!(%backend, buffered = reassembler.buffered(), "aborted mid-stream");
                return;
            }
            chunk = body.next() => chunk,
        };
        let frames = match chunk {
            Some(Ok(bytes)) => reassembler.push(&bytes),
            Some(Err(e)) if e.is_aborted() || abort.is_cancelled() => return,
            Some(Err(e)) => {
                tracing::error!(%backend, error = %e, "response stream failed");
                let _ = tx.send(TextDelta::Error(format!("{backend} request failed: {e}"))).await;
                return;
            }
            None => break,
        };
        if emit(provider, &frames, abort, tx).await == Flow::Stop {
            return;
        }
    }

    // The body ended without a terminal frame being seen.
    if emit(provider, &reassembler.finish(), abort, tx).await == Flow::Stop || abort.is_cancelled() {
        return;
    }
    tracing::debug!(%backend, "stream ended without a terminal frame");
    let _ = tx.send(TextDelta::Done { continuation: None }).await;
}

async fn emit(
    provider: &dyn Provider,
    frames: &[RawFrame],
    abort: &CancellationToken,
    tx: &mpsc::Sender<TextDelta>,
) -> Flow {
    for frame in frames {
        for delta in provider.decode(frame) {
            if abort.is_cancelled() {
                return Flow::Stop;
            }
            let terminal = delta.is_terminal();
            if tx.send(delta).await.is_err() || terminal {
                return Flow::Stop;
            }
        }
    }
    Flow::Continue
}
