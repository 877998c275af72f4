use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use btleplug::api::CharPropFlags;
use futures::{future, stream, StreamExt};
use stream_cancel::Tripwire;
use uuid::Uuid;

use crate::backend::{CharacteristicId, CharacteristicInfo};
use crate::notification::{NotificationStream, Subscription, SubscriptionState};
use crate::operation::{GattResult, OperationKind, ResultKind};
use crate::session::{Link, Session};
use crate::{Error, Result, Service};

/// Handle to a characteristic of one connection generation.
///
/// Handles are cheap to clone and keep their device's session alive, so a
/// connection stays usable while any handle exists. Once the device
/// disconnects every operation on the handle fails with
/// [`Error::Disconnected`]; after a reconnect fresh handles have to be
/// fetched from the device.
#[derive(Clone)]
pub struct Characteristic {
    /// `None` for the copies the link keeps itself.
    session: Option<Arc<Session>>,
    link: Weak<Link>,
    id: CharacteristicId,
    properties: CharPropFlags,
    value: Arc<Mutex<Option<Vec<u8>>>>,
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("id", &self.id)
            .field("properties", &self.properties)
            .field("value", &self.value())
            .finish()
    }
}

impl Characteristic {
    pub(crate) fn new(link: Weak<Link>, service: Uuid, info: CharacteristicInfo) -> Self {
        Self {
            session: None,
            link,
            id: CharacteristicId::new(service, info.uuid),
            properties: info.properties,
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// A copy for callers, holding `session` alive.
    pub(crate) fn bound(&self, session: &Arc<Session>) -> Self {
        Self {
            session: Some(session.clone()),
            ..self.clone()
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.id.uuid
    }

    pub fn id(&self) -> CharacteristicId {
        self.id
    }

    pub fn properties(&self) -> CharPropFlags {
        self.properties
    }

    /// Last value read from or notified by the characteristic.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.value.lock().unwrap().clone()
    }

    /// The service this characteristic belongs to, while connected.
    pub fn service(&self) -> Option<Service> {
        let link = self.link().ok()?;
        let service = link
            .services()
            .iter()
            .find(|service| service.uuid() == self.id.service)?;

        Some(match &self.session {
            Some(session) => service.bound(session),
            None => service.clone(),
        })
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        match self.link() {
            Ok(link) => link.notifications().state(&self.id),
            Err(_) => SubscriptionState::Unsubscribed,
        }
    }

    pub async fn read(&self) -> GattResult {
        self.request(OperationKind::Read, &[]).send().await
    }

    pub async fn write(&self, data: &[u8]) -> GattResult {
        self.request(OperationKind::Write, data).send().await
    }

    pub async fn write_without_response(&self, data: &[u8]) -> GattResult {
        self.request(OperationKind::WriteWithoutResponse, data)
            .send()
            .await
    }

    /// Builds an operation that can carry its own timeout and cancellation.
    pub fn request(&self, kind: OperationKind, payload: &[u8]) -> Request {
        Request {
            characteristic: self.clone(),
            kind,
            payload: payload.to_vec(),
            timeout: None,
            cancel: None,
        }
    }

    /// Subscribes using the adapter's default of notifications or indications.
    pub fn subscribe(&self) -> NotificationStream {
        let indicate = self
            .link()
            .map_or(false, |link| link.use_indication_default());
        self.register_and_notify(indicate)
    }

    /// Stream of value changes of this characteristic.
    ///
    /// Registration happens when the stream is first polled and is shared
    /// with every other live stream of the same characteristic. The native
    /// registration is released when the last of those streams is dropped.
    pub fn register_and_notify(&self, use_indication: bool) -> NotificationStream {
        let characteristic = self.clone();
        let setup = async move {
            let attached = characteristic.attach(use_indication).await;
            match attached {
                Ok(subscription) => subscription.boxed(),
                Err(e) => {
                    let kind = OperationKind::Subscribe {
                        indicate: use_indication,
                    };
                    stream::once(future::ready(GattResult::failure(
                        characteristic,
                        kind.into(),
                        e,
                    )))
                    .boxed()
                }
            }
        };

        NotificationStream::new(
            self.clone(),
            use_indication,
            stream::once(setup).flatten().boxed(),
        )
    }

    async fn attach(&self, indicate: bool) -> Result<Subscription> {
        self.check_supported(OperationKind::Subscribe { indicate })?;
        let link = self.link()?;

        let (receiver, registration) = link
            .notifications()
            .attach(link.queue(), self.id, indicate, link.operation_timeout())
            .await?;

        Ok(Subscription::new(
            &link,
            self.clone(),
            indicate,
            receiver,
            registration,
        ))
    }

    async fn execute(
        &self,
        kind: OperationKind,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        cancel: Option<Tripwire>,
    ) -> Result<Option<Vec<u8>>> {
        self.check_supported(kind)?;
        let link = self.link()?;

        if kind.carries_payload() {
            if let Some(max) = link.max_payload() {
                if payload.len() > max {
                    return Err(Error::PayloadTooLarge {
                        len: payload.len(),
                        max,
                    });
                }
            }
        }

        let ticket = link.queue().enqueue(
            kind,
            self.id,
            payload,
            timeout.unwrap_or_else(|| link.operation_timeout()),
            cancel.clone(),
        );
        drop(link);

        log::trace!("Waiting for {} #{} on {}", kind.name(), ticket.id(), self.id);
        ticket.wait(cancel).await
    }

    fn check_supported(&self, kind: OperationKind) -> Result<()> {
        if kind.is_supported_by(self.properties) {
            Ok(())
        } else {
            Err(Error::UnsupportedOperation {
                operation: kind.name(),
                characteristic: self.id.uuid,
            })
        }
    }

    fn link(&self) -> Result<Arc<Link>> {
        match self.link.upgrade() {
            Some(link) if !link.is_closed() => Ok(link),
            _ => Err(Error::Disconnected),
        }
    }

    pub(crate) fn cache_value(&self, value: &[u8]) {
        *self.value.lock().unwrap() = Some(value.to_vec());
    }
}

/// A GATT operation with per-call options, see [`Characteristic::request`].
#[must_use = "requests do nothing unless sent"]
pub struct Request {
    characteristic: Characteristic,
    kind: OperationKind,
    payload: Vec<u8>,
    timeout: Option<Duration>,
    cancel: Option<Tripwire>,
}

impl Request {
    /// Override the adapter's operation timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve as `Cancelled` once `tripwire` fires
    pub fn cancel_on(mut self, tripwire: Tripwire) -> Self {
        self.cancel = Some(tripwire);
        self
    }

    pub async fn send(self) -> GattResult {
        let Request {
            characteristic,
            kind,
            payload,
            timeout,
            cancel,
        } = self;

        let result = characteristic
            .execute(kind, payload, timeout, cancel)
            .await;

        if let (OperationKind::Read, Ok(Some(value))) = (kind, &result) {
            characteristic.cache_value(value);
        }

        GattResult::from_result(characteristic, ResultKind::from(kind), result)
    }
}
