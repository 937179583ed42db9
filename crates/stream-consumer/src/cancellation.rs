//! A `tokio_util::sync::CancellationToken`-shaped primitive, hand-rolled over
//! `Arc<Notify>` and an `AtomicBool` so this crate does not pull in
//! `tokio-util`'s full surface for the one type it needs (spec §9). Cloning
//! is cheap and all clones observe the same cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // `notify_waiters` only wakes tasks already parked in `cancelled()`;
        // a task that calls `cancelled()` after this still sees the flag set.
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called. Safe to call repeatedly and
    /// concurrently from any number of clones.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // `enable` registers this task as a waiter without waiting, closing the
        // gap where `cancel` could run between the flag check and the `.await`
        // below and have its `notify_waiters` call miss an as-yet-unregistered
        // `Notified` future.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Installs a task that flips this token when the process receives
    /// SIGINT or SIGTERM. Mirrors the bootstrap's `ctrl_c().shared()` pattern,
    /// extended to also honor SIGTERM since this library runs inside
    /// long-lived services as well as interactive processes.
    #[cfg(unix)]
    pub fn spawn_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::warn!(%err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
            token.cancel();
        })
    }

    #[cfg(not(unix))]
    pub fn spawn_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, shutting down");
                token.cancel();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_wakes_a_waiting_clone() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::task::yield_now().await;
        token.cancel();
        handle.await.unwrap();
    }
}
