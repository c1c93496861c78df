use anyhow::Context as _;
use bytes::Bytes;
use futures_core::stream::BoxStream;
use futures_core::Stream;
use reqwest::header::HeaderMap;
use reqwest::Url;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportFailure>>;

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportFailure>> + Send + 'a>>;

/// A fully built POST: target, headers and JSON body.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportFailure {
    #[error("request aborted")]
    Aborted,

    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to read response body: {0}")]
    Body(String),
}

impl TransportFailure {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TransportFailure::Aborted)
    }
}

impl From<reqwest::Error> for TransportFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() || err.is_decode() {
            TransportFailure::Body(err.to_string())
        } else {
            TransportFailure::Request(err.to_string())
        }
    }
}

/// One network call per generation; holds no state between calls.
///
/// Both operations must return `Aborted` without touching the network when
/// the token is already cancelled.
pub trait Transport: Send + Sync {
    /// Send the call and hand back the response body as it arrives.
    fn open_stream(&self, call: HttpCall, abort: CancellationToken) -> TransportFuture<'_, ByteStream>;

    /// Send the call and buffer the whole response body.
    fn fetch(&self, call: HttpCall, abort: CancellationToken) -> TransportFuture<'_, Bytes>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn with_default_client() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::new(http))
    }

    async fn send(
        &self,
        call: HttpCall,
        abort: &CancellationToken,
    ) -> Result<reqwest::Response, TransportFailure> {
        if abort.is_cancelled() {
            return Err(TransportFailure::Aborted);
        }

        tracing::debug!(url = %redacted(&call.url), "sending request");
        let pending = self
            .http
            .post(call.url)
            .headers(call.headers)
            .json(&call.body)
            .send();

        let resp = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(TransportFailure::Aborted),
            resp = pending => resp?,
        };

        let status = resp.status();
        if !status.is_success() {
            // The error body can stall as easily as the headers.
            let text = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(TransportFailure::Aborted),
                text = resp.text() => text.unwrap_or_default(),
            };
            return Err(TransportFailure::Status {
                status: status.as_u16(),
                body: excerpt(&text, 512),
            });
        }
        Ok(resp)
    }
}

impl Transport for ReqwestTransport {
    fn open_stream(&self, call: HttpCall, abort: CancellationToken) -> TransportFuture<'_, ByteStream> {
        Box::pin(async move {
            let resp = self.send(call, &abort).await?;
            let body = resp
                .bytes_stream()
                .map(|item| item.map_err(|e| TransportFailure::Body(e.to_string())));
            let body: ByteStream = Box::pin(body);
            Ok(Box::pin(AbortableStream::new(body, abort)) as ByteStream)
        })
    }

    fn fetch(&self, call: HttpCall, abort: CancellationToken) -> TransportFuture<'_, Bytes> {
        Box::pin(async move {
            let resp = self.send(call, &abort).await?;
            tokio::select! {
                biased;
                _ = abort.cancelled() => Err(TransportFailure::Aborted),
                body = resp.bytes() => body.map_err(|e| TransportFailure::Body(e.to_string())),
            }
        })
    }
}

/// Ends the wrapped stream as soon as the token fires. Dropping the inner
/// stream closes the underlying connection.
pub struct AbortableStream<S> {
    inner: Option<S>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> AbortableStream<S> {
    pub fn new(inner: S, abort: CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            cancelled: Box::pin(abort.cancelled_owned()),
        }
    }
}

impl<S> Stream for AbortableStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.inner = None;
            return Poll::Ready(None);
        }

        let item = Pin::new(inner).poll_next(cx);
        if let Poll::Ready(None) = item {
            this.inner = None;
        }
        item
    }
}

/// Shorten a response body for logs and error strings, on a char boundary.
pub fn excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

// Some gateways take the key as a query parameter; keep it out of logs.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
