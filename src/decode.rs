//! Frame payload → text deltas.
//!
//! Backends supply the payload shape and its projection; the rules shared by
//! all of them live here. A blank frame is skipped silently, a payload that
//! fails to parse is logged and skipped, and the stream keeps going either way.

use serde::de::DeserializeOwned;

use crate::framing::RawFrame;
use crate::provider::{Backend, TextDelta};
use crate::transport::excerpt;

pub fn decode_frame<T, F>(backend: Backend, frame: &RawFrame, project: F) -> Vec<TextDelta>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> Vec<TextDelta>,
{
    let payload = match frame {
        RawFrame::Terminal => return vec![TextDelta::Done { continuation: None }],
        RawFrame::Data { payload, .. } => payload,
    };

    if payload.trim().is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<T>(payload) {
        Ok(value) => project(value),
        Err(e) => {
            tracing::warn!(
                backend = backend.name(),
                error = %e,
                payload = %excerpt(payload, 200),
                "skipping malformed frame"
            );
            Vec::new()
        }
    }
}

/// Push a content delta unless the text is empty.
pub(crate) fn push_text(out: &mut Vec<TextDelta>, text: Option<String>) {
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        out.push(TextDelta::ContentDelta(text));
    }
}
