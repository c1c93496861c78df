//! Streaming inference client: one contract over several model backends.
//!
//! A [`Client`] resolves one backend [`Adapter`] up front and drives each
//! generation through the [`Transport`], a [`FrameReassembler`] and the
//! adapter's frame decoder. Chat rounds go through a caller-owned
//! [`Session`]; code completion is hedged by a [`HedgeController`].

pub mod cancel;
pub mod client;
pub mod decode;
pub mod framing;
pub mod hedge;
pub mod history;
pub mod provider;
pub mod transport;

pub use cancel::{AbortHandle, AbortReason};
pub use client::{Client, ClientSettings, Reply};
pub use framing::{FrameReassembler, Framing, ObjectSplit, RawFrame};
pub use hedge::{HedgeConfig, HedgeController, HedgeExit, HedgeOutcome};
pub use history::{Session, SessionBook, DEFAULT_HISTORY_CEILING, NO_RESPONSE_PLACEHOLDER};
pub use provider::{
    Adapter, Backend, ConversationTurn, Credential, FimTemplate, GenerationRequest, ProviderSettings,
    Role, TextDelta,
};
pub use transport::{ReqwestTransport, Transport, TransportFailure};
