use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Handle for one registered listener. Dropping it unsubscribes.
pub struct Subscription {
    active: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(active: Arc<AtomicBool>, detach: Box<dyn FnOnce() + Send + Sync>) -> Self {
        Self {
            active,
            detach: Some(detach),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Push-based, cancellable sequence of derived views.
///
/// The first element is always the view of the state at the time of
/// projection; one element follows per later transition. Closing or
/// dropping the projection releases its subscription.
pub struct Projection<U> {
    rx: mpsc::UnboundedReceiver<U>,
    subscription: Option<Subscription>,
}

impl<U> Projection<U> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<U>, subscription: Subscription) -> Self {
        Self {
            rx,
            subscription: Some(subscription),
        }
    }

    /// Next view, or `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<U> {
        self.rx.recv().await
    }

    /// Buffered view if one is ready.
    pub fn try_recv(&mut self) -> Option<U> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_none()
    }
}

impl<U> Stream for Projection<U> {
    type Item = U;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<U>> {
        self.rx.poll_recv(cx)
    }
}
