use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use crate::session::{ConnectionState, Link, Session};
use crate::{Characteristic, DeviceId, Error, Result, Service};

#[derive(Clone)]
pub struct Device {
    pub(crate) session: Arc<Session>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", self.session.id())
            .field("local_name", &self.session.local_name())
            .field("state", &self.session.state())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    #[inline]
    pub fn id(&self) -> &DeviceId {
        self.session.id()
    }

    /// Signal strength of the last advertisement
    #[inline]
    pub fn rssi(&self) -> Option<i16> {
        self.session.rssi()
    }

    /// Local name of the device
    #[inline]
    pub fn local_name(&self) -> Option<String> {
        self.session.local_name()
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Current connection state followed by every change
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.session.subscribe_state())
    }

    /// Connect to the device, following the connection state until the
    /// attempt ends. The stream ends after `Connected`, or after an error
    /// such as [`Error::ConnectionTimeout`].
    pub fn connect(&self, timeout: Option<Duration>) -> BoxStream<'static, Result<ConnectionState>> {
        let timeout = timeout.unwrap_or(self.session.config().connect_timeout);
        let states = WatchStream::new(self.session.subscribe_state());

        let (sender, outcome) = oneshot::channel();
        let session = self.session.clone();
        tokio::spawn(async move {
            sender.send(session.establish(timeout).await).ok();
        });

        stream::unfold(Some((states, outcome)), |progress| async move {
            let (mut states, mut outcome) = progress?;
            loop {
                tokio::select! {
                    biased;
                    result = &mut outcome => {
                        let item = match result {
                            Ok(Ok(())) => Ok(ConnectionState::Connected),
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(Error::Cancelled),
                        };
                        return Some((item, None));
                    }
                    state = states.next() => match state {
                        // Reported once the attempt has finished.
                        Some(ConnectionState::Connected) => continue,
                        Some(state) => return Some((Ok(state), Some((states, outcome)))),
                        None => {
                            let item = match outcome.await {
                                Ok(Ok(())) => Ok(ConnectionState::Connected),
                                Ok(Err(e)) => Err(e),
                                Err(_) => Err(Error::Cancelled),
                            };
                            return Some((item, None));
                        }
                    },
                }
            }
        })
        .boxed()
    }

    /// Connect and wait until the connection is ready
    pub async fn connect_wait(&self) -> Result<()> {
        let timeout = self.session.config().connect_timeout;
        let session = self.session.clone();
        tokio::spawn(session.establish(timeout))
            .await
            .map_err(|e| Error::native(e.to_string()))?
    }

    /// Disconnect from the device
    #[inline]
    pub async fn disconnect(&self) -> Result<()> {
        self.session.disconnect().await
    }

    /// Disconnect without waiting for the native stack to acknowledge it
    pub fn cancel_connection(&self) {
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.disconnect().await.ok();
                });
            }
            Err(_) => log::warn!("No runtime to disconnect {}", session.id()),
        }
    }

    /// Services discovered on the current connection. Connects first if needed.
    pub async fn services(&self) -> Result<Vec<Service>> {
        Ok(self
            .link()
            .await?
            .services()
            .iter()
            .map(|service| service.bound(&self.session))
            .collect())
    }

    /// Characteristics of every service. Connects first if needed.
    pub async fn characteristics(&self) -> Result<Vec<Characteristic>> {
        Ok(self
            .services()
            .await?
            .iter()
            .flat_map(Service::characteristics)
            .collect())
    }

    /// Get characteristic by UUID
    pub async fn characteristic(&self, uuid: Uuid) -> Result<Option<Characteristic>> {
        Ok(self
            .characteristics()
            .await?
            .into_iter()
            .find(|characteristic| characteristic.uuid() == uuid))
    }

    /// One item per characteristic of the given service, in discovery order.
    /// Empty if the device does not have that service.
    pub async fn characteristics_for_service(
        &self,
        service: Uuid,
    ) -> Result<BoxStream<'static, Characteristic>> {
        let characteristics = self
            .services()
            .await?
            .iter()
            .find(|s| s.uuid() == service)
            .map(Service::characteristics)
            .unwrap_or_default();

        Ok(stream::iter(characteristics).boxed())
    }

    async fn link(&self) -> Result<Arc<Link>> {
        if let Some(link) = self.session.link() {
            return Ok(link);
        }

        self.connect_wait().await?;
        self.session.link().ok_or(Error::Disconnected)
    }
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Discovered(Device),
    Connected(Device),
    Disconnected(Device),
    Updated(Device),
}
