//! Connection lifecycle for one device.
//!
//! A [`Session`] owns the link to its device. Every successful connection
//! opens a new [`Link`] tagged with a monotonically increasing generation;
//! the link owns that generation's discovery table, operation queue and
//! notification multiplexer. Closing a link fails everything still pending
//! on it, and handles from an old generation can never reach a newer one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use stream_cancel::{StreamExt as _, Trigger, Tripwire};
use tokio::sync::{broadcast, watch};

use crate::backend::{Advertisement, Backend, CharacteristicId, DeviceId, NativeEvent, ServiceInfo};
use crate::completion::{has_tripped, tripped};
use crate::notification::Multiplexer;
use crate::queue::OperationQueue;
use crate::{Characteristic, Config, Device, DeviceEvent, Error, Result, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Everything that only exists while one connection generation is up.
pub(crate) struct Link {
    generation: u64,
    queue: OperationQueue,
    notifications: Multiplexer,
    services: Vec<Service>,
    characteristics: HashMap<CharacteristicId, Characteristic>,
    max_payload: Option<usize>,
    operation_timeout: Duration,
    use_indication_default: bool,
    closed: AtomicBool,
    closed_signal: Tripwire,
    teardown: Mutex<Option<Trigger>>,
}

/// Size of the ATT header that every write carries.
const ATT_HEADER_LEN: usize = 3;

impl Link {
    fn open(
        backend: Arc<dyn Backend>,
        device: DeviceId,
        generation: u64,
        services: Vec<ServiceInfo>,
        config: &Config,
    ) -> Arc<Link> {
        let (teardown, closed_signal) = Tripwire::new();
        let max_payload = backend
            .mtu(&device)
            .map(|mtu| mtu.saturating_sub(ATT_HEADER_LEN));
        let queue = OperationQueue::start(backend, device, generation, closed_signal.clone());

        Arc::new_cyclic(|link| {
            let services: Vec<_> = services
                .into_iter()
                .map(|info| Service::new(link.clone(), info))
                .collect();
            let characteristics = services
                .iter()
                .flat_map(Service::characteristics)
                .map(|c| (c.id(), c))
                .collect();

            Link {
                generation,
                queue,
                notifications: Multiplexer::new(config.notification_capacity),
                services,
                characteristics,
                max_payload,
                operation_timeout: config.operation_timeout,
                use_indication_default: config.use_indication_default,
                closed: AtomicBool::new(false),
                closed_signal,
                teardown: Mutex::new(Some(teardown)),
            }
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub(crate) fn notifications(&self) -> &Multiplexer {
        &self.notifications
    }

    pub(crate) fn services(&self) -> &[Service] {
        &self.services
    }

    pub(crate) fn max_payload(&self) -> Option<usize> {
        self.max_payload
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub(crate) fn use_indication_default(&self) -> bool {
        self.use_indication_default
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails all queued operations and ends all subscriptions.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing link generation {}", self.generation);
        self.teardown.lock().unwrap().take();
        self.notifications.close();
    }

    fn on_value_changed(&self, characteristic: &CharacteristicId, value: Vec<u8>) {
        log::trace!("Value changed on {}: {:?}", characteristic, value);
        if let Some(c) = self.characteristics.get(characteristic) {
            c.cache_value(&value);
        }
        self.notifications.dispatch(characteristic, value);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Default)]
struct Properties {
    local_name: Option<String>,
    rssi: Option<i16>,
}

pub(crate) struct Session {
    id: DeviceId,
    backend: Arc<dyn Backend>,
    config: Config,
    events: broadcast::Sender<DeviceEvent>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Arc<Link>>>,
    generation: AtomicU64,
    properties: Mutex<Properties>,
    /// Set by an explicit disconnect; suppresses reconnecting.
    user_disconnect: AtomicBool,
    /// Cancels the connection attempt in progress.
    attempt: Mutex<Option<Trigger>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Session {
    pub(crate) fn new(
        id: DeviceId,
        backend: Arc<dyn Backend>,
        config: Config,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            id,
            backend,
            config,
            events,
            state,
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            properties: Mutex::new(Properties::default()),
            user_disconnect: AtomicBool::new(false),
            attempt: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> &DeviceId {
        &self.id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn local_name(&self) -> Option<String> {
        self.properties.lock().unwrap().local_name.clone()
    }

    pub(crate) fn rssi(&self) -> Option<i16> {
        self.properties.lock().unwrap().rssi
    }

    pub(crate) fn update_advertisement(&self, advertisement: &Advertisement) {
        let mut properties = self.properties.lock().unwrap();
        if advertisement.local_name.is_some() {
            properties.local_name = advertisement.local_name.clone();
        }
        if advertisement.rssi.is_some() {
            properties.rssi = advertisement.rssi;
        }
    }

    /// The link of the current generation, if connected.
    pub(crate) fn link(&self) -> Option<Arc<Link>> {
        self.link.lock().unwrap().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("{}: {} -> {}", self.id, previous, state);
        }
    }

    fn emit(self: &Arc<Self>, event: fn(Device) -> DeviceEvent) {
        // Nobody listening is fine.
        self.events.send(event(Device::new(self.clone()))).ok();
    }

    /// Connects unless already connected. Runs to completion even if the
    /// caller stops waiting, so it is always spawned.
    pub(crate) async fn establish(self: Arc<Self>, timeout: Duration) -> Result<()> {
        let _connecting = self.connecting.lock().await;

        if self.link().is_some() {
            return Ok(());
        }

        self.user_disconnect.store(false, Ordering::SeqCst);
        let (trigger, cancelled) = Tripwire::new();
        *self.attempt.lock().unwrap() = Some(trigger);

        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to {}", self.id);

        let result = tokio::select! {
            _ = tripped(Some(cancelled)) => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.open_link()) => {
                result.unwrap_or(Err(Error::ConnectionTimeout))
            }
        };
        self.attempt.lock().unwrap().take();

        match result {
            Ok(link) => {
                log::info!("Connected to {} (generation {})", self.id, link.generation());
                *self.link.lock().unwrap() = Some(link);
                self.set_state(ConnectionState::Connected);
                self.emit(DeviceEvent::Connected);
                Ok(())
            }
            Err(e) => {
                log::warn!("Could not connect to {}: {}", self.id, e);
                self.set_state(ConnectionState::Disconnected);

                // Abort the native attempt without waiting for it to acknowledge.
                let backend = self.backend.clone();
                let id = self.id.clone();
                tokio::spawn(async move {
                    backend.disconnect(&id).await.ok();
                });

                Err(e)
            }
        }
    }

    async fn open_link(self: &Arc<Self>) -> Result<Arc<Link>> {
        self.backend.connect(&self.id).await?;

        // Subscribe to native events before anything can trigger them.
        let events = self.backend.events(&self.id).await?;

        log::debug!("Discovering services of {}", self.id);
        let services = self.backend.discover_services(&self.id).await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Link::open(
            self.backend.clone(),
            self.id.clone(),
            generation,
            services,
            &self.config,
        );

        spawn_event_pump(Arc::downgrade(self), Arc::downgrade(&link), events, link.closed_signal.clone());

        Ok(link)
    }

    /// Cancels any connection attempt, fails everything pending on the
    /// current link and releases the native connection.
    pub(crate) async fn disconnect(self: &Arc<Self>) -> Result<()> {
        self.user_disconnect.store(true, Ordering::SeqCst);

        if let Some(attempt) = self.attempt.lock().unwrap().take() {
            log::debug!("Cancelling connection attempt to {}", self.id);
            drop(attempt);
        }

        let link = self.link.lock().unwrap().take();
        let link = match link {
            Some(link) => link,
            None => {
                log::info!("{} is already disconnected", self.id);
                return Ok(());
            }
        };

        self.set_state(ConnectionState::Disconnecting);
        log::info!("Disconnecting from {}", self.id);
        link.close();

        let result = self.backend.disconnect(&self.id).await;
        if let Err(e) = &result {
            log::warn!("Native disconnect of {} failed: {}", self.id, e);
        }

        self.set_state(ConnectionState::Disconnected);
        self.emit(DeviceEvent::Disconnected);
        result
    }

    fn handle_link_loss(self: &Arc<Self>, generation: u64) {
        let link = {
            let mut current = self.link.lock().unwrap();
            match current.as_ref() {
                Some(link) if link.generation() == generation => current.take(),
                _ => None,
            }
        };
        let link = match link {
            Some(link) => link,
            None => return,
        };

        log::warn!("Lost link to {} (generation {})", self.id, generation);
        link.close();
        self.set_state(ConnectionState::Disconnected);
        self.emit(DeviceEvent::Disconnected);

        if self.config.auto_reconnect && !self.user_disconnect.load(Ordering::SeqCst) {
            tokio::spawn(self.clone().reconnect());
        }
    }

    async fn reconnect(self: Arc<Self>) {
        for attempt in 0..self.config.max_retries {
            let delay = self.config.backoff(attempt);
            log::info!(
                "Reconnecting to {} in {:?} (attempt {} of {})",
                self.id,
                delay,
                attempt + 1,
                self.config.max_retries
            );
            tokio::time::sleep(delay).await;

            if self.user_disconnect.load(Ordering::SeqCst) {
                log::debug!("Reconnect to {} abandoned after disconnect", self.id);
                return;
            }

            let timeout = self.config.connect_timeout;
            match self.clone().establish(timeout).await {
                Ok(()) => return,
                Err(e) => log::warn!("Reconnect to {} failed: {}", self.id, e),
            }
        }

        log::warn!("Giving up reconnecting to {}", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let link = match self.link.get_mut().unwrap().take() {
            Some(link) => link,
            None => return,
        };

        log::info!("Releasing connection to {}, no handles left", self.id);
        link.close();

        let backend = self.backend.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.disconnect(&id).await {
                        log::warn!("Native disconnect of {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => log::warn!("No runtime to disconnect {}", self.id),
        }
    }
}

/// Routes native events of one link generation until it closes.
fn spawn_event_pump(
    session: Weak<Session>,
    link: Weak<Link>,
    events: BoxStream<'static, NativeEvent>,
    closed: Tripwire,
) {
    tokio::spawn(async move {
        let events = events.take_until_if(closed.clone());
        tokio::pin!(events);

        let mut generation = None;
        while let Some(event) = events.next().await {
            let link = match link.upgrade() {
                Some(link) => link,
                None => return,
            };
            generation = Some(link.generation());

            match event {
                NativeEvent::ValueChanged {
                    characteristic,
                    value,
                } => link.on_value_changed(&characteristic, value),
                NativeEvent::LinkLost => break,
            }
        }

        if has_tripped(&closed) {
            return;
        }

        let generation = match generation.or_else(|| link.upgrade().map(|l| l.generation())) {
            Some(generation) => generation,
            None => return,
        };
        if let Some(session) = session.upgrade() {
            session.handle_link_loss(generation);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockCall, MockPeripheral};

    fn session(mock: &MockBackend, config: Config) -> Arc<Session> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Session::new(
            DeviceId::new("dev"),
            Arc::new(mock.clone()),
            config,
            events,
        ))
    }

    #[tokio::test]
    async fn test_connect_opens_new_generation() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        let session = session(&mock, Config::default());

        session.clone().establish(Duration::from_secs(1)).await.unwrap();
        let first = session.link().unwrap();
        assert_eq!(first.generation(), 1);
        assert_eq!(first.services().len(), 2);
        assert_eq!(first.max_payload(), Some(20));
        assert_eq!(session.state(), ConnectionState::Connected);

        session.disconnect().await.unwrap();
        assert!(first.is_closed());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.clone().establish(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.link().unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_connect_timeout_cancels_native_attempt() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        mock.hang_connects(true);
        let session = session(&mock, Config::default());

        let result = session.clone().establish(Duration::from_millis(50)).await;
        assert_eq!(result, Err(Error::ConnectionTimeout));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mock
            .calls()
            .contains(&MockCall::Disconnect { device: DeviceId::new("dev") }));
    }

    #[tokio::test]
    async fn test_link_loss_reconnects_with_backoff() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        let config = Config::default()
            .auto_reconnect(true)
            .backoff_base(Duration::from_millis(10));
        let session = session(&mock, config);

        session.clone().establish(Duration::from_secs(1)).await.unwrap();
        let mut state = session.subscribe_state();

        mock.drop_link(&DeviceId::new("dev"));
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        assert_eq!(session.link().unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_no_reconnect_after_explicit_disconnect() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        let config = Config::default()
            .auto_reconnect(true)
            .backoff_base(Duration::from_millis(5));
        let session = session(&mock, config);

        session.clone().establish(Duration::from_secs(1)).await.unwrap();
        session.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let connects = mock
            .calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Connect { .. }))
            .count();
        assert_eq!(connects, 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
