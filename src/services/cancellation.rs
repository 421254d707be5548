//! Cooperative cancellation tokens.
//!
//! A [`CancellationSource`] owns the signal; its [`CancellationToken`]s
//! observe it. Cancellation is idempotent and latched: once set it
//! never clears. Linked sources cancel when any input token cancels;
//! timeout sources cancel after a duration. [`sleep`] resolves at the
//! deadline or fails with the distinguished `Cancelled` error kind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::error::RuntimeError;

type Callback = Box<dyn FnOnce(&str) + Send>;

struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_callback_id: AtomicU64,
    notify: Notify,
}

impl Inner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            notify: Notify::new(),
        }
    }

    fn cancel(&self, reason: Option<String>) {
        // Latched: only the first cancel wins.
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.unwrap_or_else(|| "cancelled".to_string());
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason.clone());
        }
        let callbacks = match self.callbacks.lock() {
            Ok(mut cbs) => std::mem::take(&mut *cbs),
            Err(_) => Vec::new(),
        };
        for (_, cb) in callbacks {
            cb(&reason);
        }
        self.notify.notify_waiters();
        debug!(%reason, "cancellation latched");
    }
}

/// Owns the cancellation signal.
pub struct CancellationSource {
    inner: Arc<Inner>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner::new()) }
    }

    /// A source that cancels itself after `duration`.
    pub fn with_timeout(duration: Duration) -> Self {
        let source = Self::new();
        source.cancel_after(duration);
        source
    }

    /// A source that cancels when any of the input tokens cancels.
    pub fn linked(parents: &[CancellationToken]) -> Self {
        let source = Self::new();
        if let Some(cancelled) = parents.iter().find(|p| p.is_cancelled()) {
            source.cancel(cancelled.reason());
            return source;
        }
        if parents.is_empty() {
            return source;
        }
        let child = source.inner.clone();
        let parents: Vec<CancellationToken> = parents.to_vec();
        tokio::spawn(async move {
            let waits: Vec<_> = parents.iter().map(|p| Box::pin(p.cancelled())).collect();
            let ((), index, remaining) = futures::future::select_all(waits).await;
            drop(remaining);
            child.cancel(parents[index].reason());
        });
        source
    }

    /// Observe the signal.
    pub fn token(&self) -> CancellationToken {
        CancellationToken { inner: self.inner.clone() }
    }

    /// Latch the signal. Idempotent; later calls are no-ops.
    pub fn cancel(&self, reason: Option<String>) {
        self.inner.cancel(reason);
    }

    /// Latch the signal after `duration` unless already cancelled.
    pub fn cancel_after(&self, duration: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            inner.cancel(Some(format!("timed out after {duration:?}")));
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer handle for a [`CancellationSource`]. Cheap to clone.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// A token that can never be cancelled.
    pub fn never() -> Self {
        Self { inner: Arc::new(Inner::new()) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The reason passed to `cancel`, once latched.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Register a callback fired exactly once on cancellation
    /// (synchronously right here if already cancelled). The returned
    /// guard unregisters on `dispose`.
    pub fn register(&self, callback: impl FnOnce(&str) + Send + 'static) -> CallbackGuard {
        if self.is_cancelled() {
            let reason = self.reason().unwrap_or_else(|| "cancelled".to_string());
            callback(&reason);
            return CallbackGuard { inner: self.inner.clone(), id: 0 };
        }
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let mut pending: Option<Callback> = Some(Box::new(callback));
        if let Ok(mut callbacks) = self.inner.callbacks.lock() {
            // Re-check under the lock: cancel may have drained the list.
            if !self.is_cancelled() {
                if let Some(cb) = pending.take() {
                    callbacks.push((id, cb));
                }
            }
        }
        if let Some(cb) = pending {
            // Raced with cancel; fire now to honour exactly-once.
            let reason = self.reason().unwrap_or_else(|| "cancelled".to_string());
            cb(&reason);
            return CallbackGuard { inner: self.inner.clone(), id: 0 };
        }
        CallbackGuard { inner: self.inner.clone(), id }
    }

    /// Error with the distinguished `Cancelled` kind if latched.
    pub fn ensure_not_cancelled(&self) -> Result<(), RuntimeError> {
        if self.is_cancelled() {
            Err(RuntimeError::Cancelled(
                self.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }
}

/// Disposer for a registered cancellation callback.
pub struct CallbackGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl CallbackGuard {
    /// Unregister the callback if it has not fired yet.
    pub fn dispose(self) {
        if self.id == 0 {
            return;
        }
        if let Ok(mut callbacks) = self.inner.callbacks.lock() {
            callbacks.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Sleep for `duration` or fail with `Cancelled`, whichever comes first.
pub async fn sleep(duration: Duration, token: &CancellationToken) -> Result<(), RuntimeError> {
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = token.cancelled() => Err(RuntimeError::Cancelled(
            token.reason().unwrap_or_else(|| "cancelled".to_string()),
        )),
    }
}
