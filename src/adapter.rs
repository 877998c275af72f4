use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::{Advertisement, Backend, DeviceId};
use crate::platform::BtleplugBackend;
use crate::session::Session;
use crate::{Config, Device, DeviceEvent, Error, Result, ScanConfig, Scanner};

struct Inner {
    backend: Arc<dyn Backend>,
    config: Config,
    sessions: Mutex<HashMap<DeviceId, Weak<Session>>>,
    events: broadcast::Sender<DeviceEvent>,
}

/// Entry point to one Bluetooth stack.
///
/// Create one per stack and pass it to whatever needs it. Devices obtained
/// through the same adapter share their connection session, so the same
/// peripheral never has two links open.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<Inner>,
}

impl Adapter {
    pub fn new(backend: impl Backend, config: Config) -> Self {
        Self::with_backend(Arc::new(backend), config)
    }

    pub fn with_backend(backend: Arc<dyn Backend>, config: Config) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                sessions: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Adapter for the host's Bluetooth stack, using its adapter at `index`.
    pub async fn platform(index: usize, config: Config) -> Result<Self> {
        let backend = BtleplugBackend::new(index).await?;
        Ok(Self::new(backend, config))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub(crate) fn event_sender(&self) -> &broadcast::Sender<DeviceEvent> {
        &self.inner.events
    }

    /// Handle for a device by id, whether or not it has been scanned.
    pub fn device(&self, id: DeviceId) -> Device {
        let mut sessions = self.inner.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&id).and_then(Weak::upgrade) {
            return Device::new(session);
        }

        sessions.retain(|_, session| session.strong_count() > 0);

        let session = Arc::new(Session::new(
            id.clone(),
            self.inner.backend.clone(),
            self.inner.config.clone(),
            self.inner.events.clone(),
        ));
        sessions.insert(id, Arc::downgrade(&session));
        Device::new(session)
    }

    pub(crate) fn device_from_advertisement(&self, advertisement: &Advertisement) -> Device {
        let device = self.device(advertisement.id.clone());
        device.session.update_advertisement(advertisement);
        device
    }

    /// Events of every device of this adapter, including connection changes.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = DeviceEvent> + Send>> {
        let receiver = self.inner.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }))
    }

    /// Scan until a device advertising `name` shows up.
    ///
    /// Gives up with [`Error::DeviceNotFound`] when the configured scan
    /// timeout passes first.
    pub async fn scan_until_device_found(&self, name: &str) -> Result<Device> {
        let wanted = name.to_string();
        let config = ScanConfig::default()
            .filter_by_name(move |name| name == wanted)
            .stop_after_first_match();

        let mut scanner = Scanner::new(self);
        let mut devices = scanner.scan(config).await?;
        let device = devices.next().await;
        scanner.stop().await?;

        device.ok_or(Error::DeviceNotFound)
    }
}
