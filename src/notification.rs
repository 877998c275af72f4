//! Fans the single native value-change channel out to per-characteristic
//! subscribers.
//!
//! Each characteristic gets one broadcast channel and one reference-counted
//! native registration. The first subscriber issues the native subscribe
//! through the operation queue, the last one to go away issues the
//! unsubscribe. Values are pushed by the link's event pump and never wait
//! on the queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use stream_cancel::Tripwire;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::CharacteristicId;
use crate::completion::tripped;
use crate::operation::{GattResult, OperationKind, ResultKind};
use crate::queue::OperationQueue;
use crate::session::Link;
use crate::{Characteristic, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

pub(crate) struct Registration {
    characteristic: CharacteristicId,
    sender: Mutex<Option<broadcast::Sender<Vec<u8>>>>,
    state: Mutex<SubscriptionState>,
    /// Serializes native subscribe/unsubscribe for this characteristic.
    subscribers: tokio::sync::Mutex<usize>,
}

impl Registration {
    fn receiver(&self) -> Option<broadcast::Receiver<Vec<u8>>> {
        self.sender.lock().unwrap().as_ref().map(|s| s.subscribe())
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap()
    }
}

/// Resets a registration whose setup was abandoned half way.
struct SetupGuard<'a> {
    registration: &'a Registration,
    armed: bool,
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registration.set_state(SubscriptionState::Unsubscribed);
        }
    }
}

pub(crate) struct Multiplexer {
    registrations: Mutex<HashMap<CharacteristicId, Arc<Registration>>>,
    capacity: usize,
}

impl Multiplexer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn registration(&self, characteristic: CharacteristicId) -> Arc<Registration> {
        self.registrations
            .lock()
            .unwrap()
            .entry(characteristic)
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.capacity);
                Arc::new(Registration {
                    characteristic,
                    sender: Mutex::new(Some(sender)),
                    state: Mutex::new(SubscriptionState::Unsubscribed),
                    subscribers: tokio::sync::Mutex::new(0),
                })
            })
            .clone()
    }

    pub(crate) fn state(&self, characteristic: &CharacteristicId) -> SubscriptionState {
        self.registrations
            .lock()
            .unwrap()
            .get(characteristic)
            .map_or(SubscriptionState::Unsubscribed, |r| r.state())
    }

    /// Delivers a native value change to every subscriber of `characteristic`.
    pub(crate) fn dispatch(&self, characteristic: &CharacteristicId, value: Vec<u8>) {
        let registrations = self.registrations.lock().unwrap();
        let sender = registrations
            .get(characteristic)
            .and_then(|r| r.sender.lock().unwrap().clone());

        match sender {
            Some(sender) => {
                let delivered = sender.send(value).unwrap_or(0);
                log::trace!("Value of {} delivered to {} subscribers", characteristic, delivered);
            }
            None => log::trace!("Dropping value of unregistered {}", characteristic),
        }
    }

    /// Ends every subscriber stream. Called once when the link goes down.
    pub(crate) fn close(&self) {
        let registrations: Vec<_> = self.registrations.lock().unwrap().drain().collect();
        for (_, registration) in registrations {
            registration.sender.lock().unwrap().take();
            registration.set_state(SubscriptionState::Unsubscribed);
        }
    }

    /// Adds a subscriber, registering with the native stack if it is the first.
    pub(crate) async fn attach(
        &self,
        queue: &OperationQueue,
        characteristic: CharacteristicId,
        indicate: bool,
        timeout: Duration,
    ) -> Result<(broadcast::Receiver<Vec<u8>>, Arc<Registration>)> {
        let registration = self.registration(characteristic);
        let mut subscribers = registration.subscribers.lock().await;
        let receiver = registration.receiver().ok_or(Error::Disconnected)?;

        if *subscribers == 0 {
            registration.set_state(SubscriptionState::Subscribing);
            let mut guard = SetupGuard {
                registration: &registration,
                armed: true,
            };

            queue
                .enqueue(
                    OperationKind::Subscribe { indicate },
                    characteristic,
                    Vec::new(),
                    timeout,
                    None,
                )
                .wait(None)
                .await?;

            guard.armed = false;
            registration.set_state(SubscriptionState::Subscribed);
            log::debug!("Registered for value changes of {}", characteristic);
        }

        *subscribers += 1;
        log::debug!("{} now has {} subscribers", characteristic, *subscribers);
        drop(subscribers);

        Ok((receiver, registration))
    }

    /// Removes a subscriber, unregistering natively if it was the last.
    pub(crate) async fn detach(
        &self,
        queue: &OperationQueue,
        registration: &Registration,
        timeout: Duration,
    ) {
        let mut subscribers = registration.subscribers.lock().await;
        *subscribers = subscribers.saturating_sub(1);

        if *subscribers > 0 || registration.state() != SubscriptionState::Subscribed {
            return;
        }

        let characteristic = registration.characteristic;
        let result = queue
            .enqueue(
                OperationKind::Unsubscribe,
                characteristic,
                Vec::new(),
                timeout,
                None,
            )
            .wait(None)
            .await;

        registration.set_state(SubscriptionState::Unsubscribed);
        match result {
            Ok(_) => log::debug!("Unregistered from value changes of {}", characteristic),
            Err(e) => log::warn!("Could not unsubscribe from {}: {}", characteristic, e),
        }
    }
}

/// Releases one subscriber reference when the stream is dropped.
struct SubscriptionGuard {
    link: Weak<Link>,
    registration: Arc<Registration>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let link = match self.link.upgrade() {
            Some(link) if !link.is_closed() => link,
            _ => return,
        };
        let registration = self.registration.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    link.notifications()
                        .detach(link.queue(), &registration, link.operation_timeout())
                        .await;
                });
            }
            Err(_) => log::warn!(
                "No runtime to unsubscribe from {}",
                registration.characteristic
            ),
        }
    }
}

/// Live values of one characteristic for one subscriber.
pub(crate) struct Subscription {
    values: BroadcastStream<Vec<u8>>,
    characteristic: Characteristic,
    kind: ResultKind,
    guard: Option<SubscriptionGuard>,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        link: &Arc<Link>,
        characteristic: Characteristic,
        indicate: bool,
        receiver: broadcast::Receiver<Vec<u8>>,
        registration: Arc<Registration>,
    ) -> Self {
        Self {
            values: BroadcastStream::new(receiver),
            characteristic,
            kind: if indicate {
                ResultKind::Indication
            } else {
                ResultKind::Notification
            },
            guard: Some(SubscriptionGuard {
                link: Arc::downgrade(link),
                registration,
            }),
            finished: false,
        }
    }
}

impl Stream for Subscription {
    type Item = GattResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.values.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(value))) => {
                    return Poll::Ready(Some(GattResult::success(
                        self.characteristic.clone(),
                        self.kind,
                        Some(value),
                    )));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    log::warn!(
                        "Subscriber of {} lagged behind, {} values skipped",
                        self.characteristic.uuid(),
                        skipped
                    );
                }
                Poll::Ready(None) => {
                    // The link went down; there is nothing left to unsubscribe.
                    self.finished = true;
                    self.guard.take();
                    return Poll::Ready(Some(GattResult::failure(
                        self.characteristic.clone(),
                        self.kind,
                        Error::Disconnected,
                    )));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Stream of value changes returned by
/// [`Characteristic::register_and_notify`](crate::Characteristic::register_and_notify).
///
/// Yields one [`GattResult`] per received value until dropped. A lost link
/// ends the stream with a failed result instead of silently stopping; so
/// does a failed registration and [`cancel_on`](Self::cancel_on).
#[must_use = "streams do nothing unless polled"]
pub struct NotificationStream {
    characteristic: Characteristic,
    kind: ResultKind,
    inner: Option<BoxStream<'static, GattResult>>,
    cancel: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl NotificationStream {
    pub(crate) fn new(
        characteristic: Characteristic,
        indicate: bool,
        inner: BoxStream<'static, GattResult>,
    ) -> Self {
        Self {
            characteristic,
            kind: if indicate {
                ResultKind::Indication
            } else {
                ResultKind::Notification
            },
            inner: Some(inner),
            cancel: None,
        }
    }

    /// End the stream with a `Cancelled` result once `tripwire` fires.
    pub fn cancel_on(mut self, tripwire: Tripwire) -> Self {
        self.cancel = Some(Box::pin(tripped(Some(tripwire))));
        self
    }
}

impl Stream for NotificationStream {
    type Item = GattResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.inner.is_none() {
            return Poll::Ready(None);
        }

        if let Some(cancel) = self.cancel.as_mut() {
            if cancel.as_mut().poll(cx).is_ready() {
                self.cancel = None;
                self.inner = None;
                return Poll::Ready(Some(GattResult::failure(
                    self.characteristic.clone(),
                    self.kind,
                    Error::Cancelled,
                )));
            }
        }

        let polled = match self.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        };
        if let Poll::Ready(None) = polled {
            self.inner = None;
        }
        polled
    }
}
