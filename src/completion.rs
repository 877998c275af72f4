//! Bridges from native completions to futures and streams.
//!
//! Native stacks report results through callbacks that may fire late, twice,
//! or never. [`Completer`] is the callback side of a single-resolution slot:
//! the first completion wins and every later one is dropped. [`Completion`]
//! is the awaiting side and resolves to [`Error::Disconnected`] when every
//! completer is dropped unresolved, so a torn-down link never leaves a
//! caller hanging.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{FutureExt, Stream};
use stream_cancel::Tripwire;
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Creates a connected completer/completion pair.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        Completer {
            slot: Arc::new(Mutex::new(Some(sender))),
        },
        Completion { receiver },
    )
}

pub struct Completer<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<T>>>>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Completer<T> {
    /// Resolves the slot. Returns `false` if it was already resolved.
    pub fn complete(&self, result: Result<T>) -> bool {
        let sender = self.slot.lock().unwrap().take();
        match sender {
            Some(sender) => {
                // The awaiting side may be gone already; that is not an error.
                sender.send(result).ok();
                true
            }
            None => {
                log::trace!("Ignoring completion of an already resolved operation");
                false
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |sender| sender.is_closed())
    }
}

pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves once `tripwire` fires. Never resolves for `None` or for a
/// trigger that was disabled instead of cancelled.
pub(crate) async fn tripped(tripwire: Option<Tripwire>) {
    if let Some(tripwire) = tripwire {
        if tripwire.await {
            return;
        }
    }
    futures::future::pending::<()>().await
}

/// Non-blocking check whether `tripwire` has already fired.
pub(crate) fn has_tripped(tripwire: &Tripwire) -> bool {
    tripwire.clone().now_or_never().unwrap_or(false)
}

/// Stream returned by [`SwitchLatestExt::switch_latest`].
#[must_use = "streams do nothing unless polled"]
pub struct SwitchLatest<S, F, Fut> {
    source: Option<S>,
    make: F,
    current: Option<Pin<Box<Fut>>>,
}

impl<S, F, Fut> Stream for SwitchLatest<S, F, Fut>
where
    S: Stream + Unpin,
    F: FnMut(S::Item) -> Fut + Unpin,
    Fut: Future,
{
    type Item = Fut::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while let Some(source) = this.source.as_mut() {
            match Pin::new(source).poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if this.current.is_some() {
                        log::trace!("Newer item arrived, dropping the pending one");
                    }
                    this.current = Some(Box::pin((this.make)(item)));
                }
                Poll::Ready(None) => this.source = None,
                Poll::Pending => break,
            }
        }

        if let Some(current) = this.current.as_mut() {
            if let Poll::Ready(output) = current.as_mut().poll(cx) {
                this.current = None;
                return Poll::Ready(Some(output));
            }
        }

        if this.source.is_none() && this.current.is_none() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

pub trait SwitchLatestExt: Stream + Sized {
    /// Maps every item to a future, dropping the previous future whenever a
    /// new item arrives before it finished. Only the latest future's output
    /// is ever observed.
    fn switch_latest<F, Fut>(self, make: F) -> SwitchLatest<Self, F, Fut>
    where
        F: FnMut(Self::Item) -> Fut,
        Fut: Future,
    {
        SwitchLatest {
            source: Some(self),
            make,
            current: None,
        }
    }
}

impl<S: Stream> SwitchLatestExt for S {}
