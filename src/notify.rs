//! One-shot close signal shared between a connection and everything attached to it.
//!
//! The [`Trigger`] side fires once; every [`Closed`] clone observes it, whether it was
//! waiting before the signal fired or starts waiting afterwards.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::watch;

use crate::BoxFuture;

#[derive(Debug, Clone)]
pub(crate) struct Trigger(Arc<watch::Sender<bool>>);

impl Trigger {
    /// Fire the signal. Returns `true` only for the call which changed the state.
    pub(crate) fn fire(&self) -> bool {
        let fired = self.0.send_if_modified(|closed| !std::mem::replace(closed, true));
        if fired {
            tracing::trace!("sending close signal");
        }
        fired
    }

    #[cfg(test)]
    pub(crate) fn is_fired(&self) -> bool {
        *self.0.borrow()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Closed(watch::Receiver<bool>);

impl Closed {
    pub(crate) fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

impl IntoFuture for Closed {
    type IntoFuture = Notified;
    type Output = ();

    fn into_future(mut self) -> Self::IntoFuture {
        Notified(Box::pin(async move {
            // An error means every trigger is gone, which closes the connection as well.
            let _ = self.0.wait_for(|closed| *closed).await;
        }))
    }
}

#[pin_project::pin_project]
pub(crate) struct Notified(#[pin] BoxFuture<'static, ()>);

impl Future for Notified {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

pub(crate) fn channel() -> (Trigger, Closed) {
    let (tx, rx) = watch::channel(false);
    (Trigger(Arc::new(tx)), Closed(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use futures::FutureExt as _;

    #[tokio::test]
    async fn fire_wakes_waiters() {
        let (trigger, closed) = channel();
        let other = closed.clone();

        let first = tokio::spawn(async move { closed.await });
        let second = tokio::spawn(async move { other.await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(trigger.fire());

        assert!(timeout(Duration::from_millis(100), first).await.is_ok());
        assert!(timeout(Duration::from_millis(100), second).await.is_ok());
    }

    #[tokio::test]
    async fn fire_only_once() {
        let (trigger, closed) = channel();
        assert!(!closed.is_closed());
        assert!(!trigger.is_fired());

        assert!(trigger.fire());
        assert!(!trigger.clone().fire());

        assert!(closed.is_closed());
        assert!(trigger.is_fired());
    }

    #[tokio::test]
    async fn late_waiter_sees_signal() {
        let (trigger, closed) = channel();
        trigger.fire();
        assert!(closed.into_future().now_or_never().is_some());
    }

    #[tokio::test]
    async fn dropped_trigger_resolves() {
        let (trigger, closed) = channel();
        let waiting = closed.clone().into_future();
        drop(trigger);
        assert!(
            timeout(Duration::from_millis(100), waiting).await.is_ok(),
            "dropping every trigger should release waiters"
        );
        assert!(!closed.is_closed());
    }

    #[tokio::test]
    async fn pending_until_fired() {
        let (_trigger, closed) = channel();
        let mut waiting = closed.into_future();
        assert!(futures::poll!(&mut waiting).is_pending());
    }
}
