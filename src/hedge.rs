//! Bounded-latency code completion.
//!
//! [`HedgeController::race`] drains a delta stream in the background and
//! polls what has accumulated on a fixed interval. It returns as soon as the
//! generation is done, or enough complete lines have arrived after a minimum
//! delay, or the hard deadline passes. In every case the background
//! generation is aborted through its scope before returning.

use futures_core::stream::BoxStream;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::provider::TextDelta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HedgeConfig {
    pub poll_interval: Duration,
    pub deadline: Duration,
    pub min_elapsed: Duration,
    pub min_lines: usize,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            deadline: Duration::from_millis(4500),
            min_elapsed: Duration::from_millis(1000),
            min_lines: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeExit {
    /// The generation finished on its own.
    Done,
    /// Enough complete lines arrived after `min_elapsed`.
    LineThreshold,
    Deadline,
    /// The caller's token fired.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HedgeOutcome {
    pub text: String,
    pub exit: HedgeExit,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone)]
struct Progress {
    text: String,
    finished: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HedgeController {
    config: HedgeConfig,
}

impl HedgeController {
    pub fn new(config: HedgeConfig) -> Self {
        Self { config }
    }

    /// Race `deltas` against the thresholds. `scope` must be the token the
    /// generation behind `deltas` was started with; it is cancelled on return.
    pub async fn race(&self, deltas: BoxStream<'static, TextDelta>, scope: CancellationToken) -> HedgeOutcome {
        let cfg = self.config;
        let started = Instant::now();
        let (tx, rx) = watch::channel(Progress::default());
        let consumer = tokio::spawn(consume(deltas, tx, scope.clone()));

        let mut ticker = tokio::time::interval(cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break HedgeExit::Cancelled,
                _ = ticker.tick() => {}
            }

            let elapsed = started.elapsed();
            let (finished, lines) = {
                let progress = rx.borrow();
                (progress.finished, complete_lines(&progress.text))
            };

            if finished {
                break HedgeExit::Done;
            }
            if lines >= cfg.min_lines && elapsed > cfg.min_elapsed {
                break HedgeExit::LineThreshold;
            }
            if elapsed >= cfg.deadline {
                break HedgeExit::Deadline;
            }
        };

        scope.cancel();
        if let Err(e) = consumer.await {
            tracing::warn!(error = %e, "hedge consumer did not exit cleanly");
        }

        let text = {
            let progress = rx.borrow();
            match exit {
                HedgeExit::LineThreshold => whole_lines(&progress.text).to_string(),
                _ => progress.text.clone(),
            }
        };
        let elapsed = started.elapsed();
        tracing::info!(exit = ?exit, elapsed_ms = elapsed.as_millis() as u64, chars = text.len(), "hedged completion returned");

        HedgeOutcome { text, exit, elapsed }
    }
}

async fn consume(mut deltas: BoxStream<'static, TextDelta>, tx: watch::Sender<Progress>, scope: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            next = deltas.next() => next,
        };
        match next {
            Some(TextDelta::ContentStart(text)) | Some(TextDelta::ContentDelta(text)) => {
                tx.send_modify(|p| p.text.push_str(&text));
            }
            Some(TextDelta::Error(e)) => {
                tracing::warn!(error = %e, "completion stream failed");
                tx.send_modify(|p| p.finished = true);
                return;
            }
            Some(TextDelta::Done { .. }) | None => {
                tx.send_modify(|p| p.finished = true);
                return;
            }
        }
    }
}

fn complete_lines(text: &str) -> usize {
    text.matches('\n').count()
}

// Everything before the last line break.
fn whole_lines(text: &str) -> &str {
    match text.rfind('\n') {
        Some(i) => &text[..i],
        None => "",
    }
}
