//! Notification Coordinator: best-effort push delivery to a user's devices.
//!
//! Every entry point filters out subscriptions with `logged_in == false` and
//! sends to the rest independently. A failure for one subscription is logged
//! and never reaches the caller.

pub mod payload;
pub mod transport;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sketchmate_shared::NotificationSubscription;

pub use payload::PushPayload;
pub use transport::{
    FcmTransport, LogTransport, NotificationDeliveryError, PushTransport, TokenSource,
};

/// Result of [`Notifier::notify_dual`]: the visible half has been sent, the
/// silent half is still scheduled.
pub struct DualDelivery {
    pub visible: usize,
    pub silent: JoinHandle<usize>,
}

#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn PushTransport>,
    silent_delay: Duration,
}

impl Notifier {
    pub fn new(transport: Arc<dyn PushTransport>, silent_delay: Duration) -> Self {
        Self {
            transport,
            silent_delay,
        }
    }

    /// Send to every live subscription. Returns how many sends succeeded.
    pub async fn notify(
        &self,
        subscriptions: &[NotificationSubscription],
        payload: &PushPayload,
    ) -> usize {
        deliver(self.transport.as_ref(), subscriptions, payload).await
    }

    /// Data-only variant of [`Notifier::notify`].
    pub async fn notify_silent(
        &self,
        subscriptions: &[NotificationSubscription],
        payload: &PushPayload,
    ) -> usize {
        deliver(self.transport.as_ref(), subscriptions, &payload.silent()).await
    }

    /// Visible push now, silent copy after the configured delay.
    pub async fn notify_dual(
        &self,
        subscriptions: &[NotificationSubscription],
        payload: &PushPayload,
    ) -> DualDelivery {
        let visible = self.notify(subscriptions, payload).await;

        let transport = self.transport.clone();
        let delay = self.silent_delay;
        let targets = subscriptions.to_vec();
        let silent_payload = payload.silent();
        let silent = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            deliver(transport.as_ref(), &targets, &silent_payload).await
        });

        DualDelivery { visible, silent }
    }
}

/// Detached push work. Callers hand it a delivery future and move on;
/// shutdown and tests can wait until nothing is outstanding.
#[derive(Clone, Default)]
pub struct PushTasks {
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

struct PendingGuard(PushTasks);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl PushTasks {
    pub fn spawn<F>(&self, delivery: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            delivery.await;
        });
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolve once every spawned delivery has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn deliver(
    transport: &dyn PushTransport,
    subscriptions: &[NotificationSubscription],
    payload: &PushPayload,
) -> usize {
    let sends = subscriptions
        .iter()
        .filter(|s| s.logged_in)
        .map(|target| async move {
            match transport.send(target, payload).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(fingerprint = %target.fingerprint, error = %e, "Push delivery failed");
                    false
                }
            }
        });

    let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
    debug!(
        delivered,
        kind = payload.kind().unwrap_or("unknown"),
        silent = payload.is_silent(),
        "Push fan-out finished"
    );
    delivered
}
