//! One effective abort signal per generation call.
//!
//! An [`AbortHandle`] merges the caller's token with a request timeout. The
//! first source to fire cancels the handle's own token, exactly once; the
//! watcher that listens to both sources is gone as soon as that happens, or
//! as soon as the call completes and [`AbortHandle::release`] is awaited.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    External,
    Timeout,
}

#[derive(Debug)]
pub struct AbortHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
    listeners: Arc<AtomicUsize>,
    release: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

// Counts registered source listeners for as long as it lives.
struct ListenerGuard {
    count: Arc<AtomicUsize>,
    n: usize,
}

impl ListenerGuard {
    fn register(count: &Arc<AtomicUsize>, n: usize) -> Self {
        count.fetch_add(n, Ordering::SeqCst);
        Self {
            count: Arc::clone(count),
            n,
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(self.n, Ordering::SeqCst);
    }
}

fn fire(token: &CancellationToken, reason: &OnceLock<AbortReason>, why: AbortReason) {
    if reason.set(why).is_ok() {
        tracing::debug!(reason = ?why, "abort handle triggered");
        token.cancel();
    }
}

impl AbortHandle {
    /// Link `external` with a `timeout`. Must be called from within a tokio
    /// runtime unless `external` is already cancelled.
    pub fn link(external: &CancellationToken, timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());
        let listeners = Arc::new(AtomicUsize::new(0));
        let release = CancellationToken::new();

        if external.is_cancelled() {
            fire(&token, &reason, AbortReason::External);
            return Self {
                token,
                reason,
                listeners,
                release,
                watcher: None,
            };
        }

        // External token and timer.
        let guard = ListenerGuard::register(&listeners, 2);
        let watcher = {
            let external = external.clone();
            let token = token.clone();
            let reason = Arc::clone(&reason);
            let release = release.clone();
            tokio::spawn(async move {
                let _guard = guard;
                tokio::select! {
                    biased;
                    _ = release.cancelled() => {}
                    _ = external.cancelled() => fire(&token, &reason, AbortReason::External),
                    _ = tokio::time::sleep(timeout) => fire(&token, &reason, AbortReason::Timeout),
                }
            })
        };

        Self {
            token,
            reason,
            listeners,
            release,
            watcher: Some(watcher),
        }
    }

    /// The merged token handed to the transport.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Which source fired first, if any has.
    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Deregister both source listeners and wait until they are gone.
    /// Safe to call more than once.
    pub async fn release(&mut self) {
        self.release.cancel();
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                tracing::warn!(error = %e, "abort watcher did not exit cleanly");
            }
        }
    }
}

impl Drop for AbortHandle {
    fn drop(&mut self) {
        // The watcher exits on its next poll.
        self.release.cancel();
    }
}
