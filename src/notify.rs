//! A one-shot close signal.
//!
//! The pool holds the [`Trigger`]; requests in flight hold a [`Signal`] and race it against
//! their exchange, so closing the pool interrupts them.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::BoxFuture;

/// Fires the signal when triggered or dropped.
#[derive(Debug)]
pub(crate) struct Trigger(Option<tokio::sync::watch::Receiver<()>>);

impl Trigger {
    pub(crate) fn fire(&mut self) {
        if self.0.take().is_some() {
            tracing::trace!("sending close signal");
        }
    }
}

/// Resolves once the matching [`Trigger`] fires.
#[derive(Debug, Clone)]
pub(crate) struct Signal(Arc<tokio::sync::watch::Sender<()>>);

impl Signal {
    pub(crate) fn is_fired(&self) -> bool {
        self.0.is_closed()
    }
}

impl IntoFuture for Signal {
    type IntoFuture = Fired;
    type Output = ();

    fn into_future(self) -> Self::IntoFuture {
        Fired(Box::pin(async move {
            self.0.closed().await;
        }))
    }
}

#[pin_project::pin_project]
pub(crate) struct Fired(#[pin] BoxFuture<'static, ()>);

impl std::fmt::Debug for Fired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fired").finish_non_exhaustive()
    }
}

impl Future for Fired {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

pub(crate) fn channel() -> (Trigger, Signal) {
    let (tx, rx) = tokio::sync::watch::channel(());
    (Trigger(Some(rx)), Signal(Arc::new(tx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn fire_wakes_every_signal() {
        let (mut trigger, signal) = channel();
        let other = signal.clone();
        assert!(!signal.is_fired());

        let first = tokio::spawn(async move { signal.await });
        let second = tokio::spawn(async move { other.await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.fire();

        assert!(timeout(Duration::from_millis(100), first).await.is_ok());
        assert!(timeout(Duration::from_millis(100), second).await.is_ok());
    }

    #[tokio::test]
    async fn fire_is_idempotent() {
        let (mut trigger, signal) = channel();
        trigger.fire();
        trigger.fire();
        assert!(signal.is_fired());
        timeout(Duration::from_millis(100), signal.into_future())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_trigger_fires() {
        let (trigger, signal) = channel();
        drop(trigger);
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn unfired_signal_stays_pending() {
        let (_trigger, signal) = channel();
        assert!(
            timeout(Duration::from_millis(20), signal.into_future())
                .await
                .is_err()
        );
    }
}
