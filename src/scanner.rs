use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{future, Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::backend::{Advertisement, DeviceId};
use crate::{Adapter, Device, DeviceEvent, Result};

#[derive(Default)]
pub struct ScanConfig {
    /// Filters the found devices based on device id.
    id_filter: Option<Box<dyn Fn(&DeviceId) -> bool + Send + Sync>>,
    /// Filters the found devices based on local name.
    name_filter: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    /// Only devices advertising one of these services are reported.
    services: Vec<Uuid>,
    /// Maximum results before the scan is stopped.
    max_results: Option<usize>,
    /// The scan is stopped when timeout duration is reached.
    timeout: Option<Duration>,
}

impl ScanConfig {
    /// Filter scanned devices based on the device id
    pub fn filter_by_id(mut self, func: impl Fn(&DeviceId) -> bool + Send + Sync + 'static) -> Self {
        self.id_filter = Some(Box::new(func));
        self
    }

    /// Filter scanned devices based on the device name
    pub fn filter_by_name(mut self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.name_filter = Some(Box::new(func));
        self
    }

    /// Filter scanned devices based on advertised services
    pub fn filter_by_services(mut self, services: &[Uuid]) -> Self {
        self.services = services.to_vec();
        self
    }

    /// Stop the scan after given number of matches
    pub fn stop_after_matches(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Stop the scan after the first match
    pub fn stop_after_first_match(self) -> Self {
        self.stop_after_matches(1)
    }

    /// Stop the scan after given duration
    pub fn stop_after_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require that the scanned devices have a name
    pub fn require_name(self) -> Self {
        if self.name_filter.is_none() {
            self.filter_by_name(|name| !name.is_empty())
        } else {
            self
        }
    }
}

/// Items on a scanner's own channel. `Finished` is sent after the last
/// discovery so streams end without losing anything queued before it.
#[derive(Clone)]
enum ScanEvent {
    Device(DeviceEvent),
    Finished,
}

pub struct Scanner {
    adapter: Adapter,
    event_sender: broadcast::Sender<ScanEvent>,
    running: Arc<AtomicBool>,
    scan_stopper: Option<Trigger>,
    device_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
}

impl Scanner {
    pub fn new(adapter: &Adapter) -> Self {
        let (event_sender, _) = broadcast::channel(64);

        Self {
            adapter: adapter.clone(),
            event_sender,
            running: Arc::new(AtomicBool::new(false)),
            scan_stopper: None,
            device_stream_stoppers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Start scanning for ble devices.
    pub async fn start(&mut self, config: ScanConfig) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::info!("Scanner is already started.");
            return Ok(());
        }

        match ScanContext::start(
            config,
            self.adapter.clone(),
            self.event_sender.clone(),
            self.running.clone(),
        )
        .await
        {
            Ok(stopper) => {
                self.scan_stopper = Some(stopper);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Start scanning and return the stream of matching devices.
    ///
    /// Unlike calling [`Scanner::start`] and [`Scanner::device_stream`] in
    /// turn, no device found in between can be missed. The stream ends when
    /// the scan does.
    pub async fn scan(
        &mut self,
        config: ScanConfig,
    ) -> Result<Valved<Pin<Box<dyn Stream<Item = Device> + Send>>>> {
        let stream = self.device_stream();
        self.start(config).await?;
        Ok(stream)
    }

    /// Stop scanning for ble devices.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(stopper) = self.scan_stopper.take() {
            if self.running.load(Ordering::SeqCst) {
                self.adapter.backend().stop_scan().await?;
            }
            drop(stopper);
            self.device_stream_stoppers.write().unwrap().clear();
        } else {
            log::info!("Scanner is already stopped");
        }

        Ok(())
    }

    fn scan_events(&self) -> Pin<Box<dyn Stream<Item = DeviceEvent> + Send>> {
        let receiver = self.event_sender.subscribe();

        Box::pin(
            BroadcastStream::new(receiver)
                .filter_map(|x| async move { x.ok() })
                .take_while(|event| future::ready(!matches!(event, ScanEvent::Finished)))
                .filter_map(|event| async move {
                    match event {
                        ScanEvent::Device(event) => Some(event),
                        ScanEvent::Finished => None,
                    }
                }),
        )
    }

    /// Create a new stream that receives ble device events.
    pub fn device_event_stream(
        &mut self,
    ) -> Valved<Pin<Box<dyn Stream<Item = DeviceEvent> + Send>>> {
        let (trigger, stream) = Valved::new(self.scan_events());
        self.device_stream_stoppers.write().unwrap().push(trigger);

        stream
    }

    /// Create a new stream that receives discovered ble devices.
    pub fn device_stream(&mut self) -> Valved<Pin<Box<dyn Stream<Item = Device> + Send>>> {
        let stream: Pin<Box<dyn Stream<Item = Device> + Send>> =
            Box::pin(self.scan_events().filter_map(|event| async move {
                match event {
                    DeviceEvent::Discovered(device) => Some(device),
                    _ => None,
                }
            }));

        let (trigger, stream) = Valved::new(stream);
        self.device_stream_stoppers.write().unwrap().push(trigger);

        stream
    }
}

struct ScanContext {
    /// Number of matching devices found so far
    result_count: usize,
    /// Adapter the scan runs on
    adapter: Adapter,
    /// Configurations for the scan, such as filters and stop conditions
    config: ScanConfig,
    /// Set of devices that have been filtered and will be ignored
    filtered: HashSet<DeviceId>,
    /// Set of devices that matched the filters
    matched: HashSet<DeviceId>,
    /// Channel for sending events to the scanner's streams
    event_sender: broadcast::Sender<ScanEvent>,
}

impl ScanContext {
    async fn start(
        mut config: ScanConfig,
        adapter: Adapter,
        event_sender: broadcast::Sender<ScanEvent>,
        running: Arc<AtomicBool>,
    ) -> Result<Trigger> {
        log::info!("Starting the scan");

        if config.timeout.is_none() {
            config.timeout = adapter.config().scan_timeout;
        }

        let (stopper, advertisements) =
            Valved::new(adapter.backend().scan(&config.services).await?);

        let ctx = ScanContext {
            result_count: 0,
            adapter,
            config,
            filtered: HashSet::new(),
            matched: HashSet::new(),
            event_sender,
        };

        tokio::spawn(async move {
            ctx.listen(advertisements, running).await;
        });

        Ok(stopper)
    }

    async fn listen(
        mut self,
        mut advertisements: Valved<BoxStream<'static, Advertisement>>,
        running: Arc<AtomicBool>,
    ) {
        let deadline = self.config.timeout.map(|timeout| Instant::now() + timeout);
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending().await,
            }
        };
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    log::info!("Scan timeout reached.");
                    break;
                }
                advertisement = advertisements.next() => match advertisement {
                    Some(advertisement) => self.on_advertisement(advertisement),
                    None => break,
                },
            }

            let max_result_reached = self
                .config
                .max_results
                .filter(|max_results| self.result_count >= *max_results)
                .is_some();

            if max_result_reached {
                log::info!("Scanner stop condition reached.");
                break;
            }
        }

        if let Err(e) = self.adapter.backend().stop_scan().await {
            log::warn!("Could not stop the scan: {}", e);
        }
        running.store(false, Ordering::SeqCst);
        self.event_sender.send(ScanEvent::Finished).ok();

        log::info!("Scanner was stopped.");
    }

    fn send(&self, event: DeviceEvent) -> bool {
        self.adapter.event_sender().send(event.clone()).ok();
        self.event_sender.send(ScanEvent::Device(event)).is_ok()
    }

    fn on_advertisement(&mut self, advertisement: Advertisement) {
        log::trace!("Advertisement: {:?}", advertisement);

        if self.matched.contains(&advertisement.id) {
            let device = self.adapter.device_from_advertisement(&advertisement);
            self.send(DeviceEvent::Updated(device));
            return;
        }

        if self.filtered.contains(&advertisement.id) {
            // The device has already been filtered.
            return;
        }

        match self.passes_filters(&advertisement) {
            Some(false) => {
                self.filtered.insert(advertisement.id);
            }
            None => {
                // Name not advertised yet, check again on the next report
            }
            Some(true) => self.add_device(advertisement),
        }
    }

    fn add_device(&mut self, advertisement: Advertisement) {
        self.matched.insert(advertisement.id.clone());

        let device = self.adapter.device_from_advertisement(&advertisement);
        log::info!("Found device: {:?}", device);

        if self.send(DeviceEvent::Discovered(device)) {
            self.result_count += 1;
        } else {
            log::error!("Failed to add device: nobody is listening");
        }
    }

    /// Checks the advertisement against every configured filter.
    fn passes_filters(&self, advertisement: &Advertisement) -> Option<bool> {
        let mut passed = true;

        if let Some(filter_by_id) = self.config.id_filter.as_ref() {
            passed &= filter_by_id(&advertisement.id);
        }

        if let Some(filter_by_name) = self.config.name_filter.as_ref() {
            passed &= advertisement
                .local_name
                .as_deref()
                .map(|name| filter_by_name(name))?;
        }

        Some(passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockPeripheral};
    use crate::Config;

    fn adapter() -> Adapter {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("sensor-1"));
        mock.add_peripheral(MockPeripheral::sample("sensor-2").with_name("Second"));
        mock.add_peripheral(MockPeripheral::scratch("bean", 5));
        mock.add_peripheral(MockPeripheral::new("anonymous"));
        Adapter::new(mock, Config::default())
    }

    #[tokio::test]
    async fn test_scan_stops_after_max_matches() {
        let adapter = adapter();
        let mut scanner = Scanner::new(&adapter);

        let devices: Vec<_> = scanner
            .scan(ScanConfig::default().require_name().stop_after_matches(2))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.local_name().is_some()));
    }

    #[tokio::test]
    async fn test_scan_filters_by_id_and_service() {
        let adapter = adapter();
        let mut scanner = Scanner::new(&adapter);

        let config = ScanConfig::default()
            .filter_by_services(&[crate::mock::SCRATCH_SERVICE])
            .stop_after_timeout(Duration::from_millis(50));
        let devices: Vec<_> = scanner.scan(config).await.unwrap().collect().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), &DeviceId::new("bean"));

        let mut scanner = Scanner::new(&adapter);
        let config = ScanConfig::default()
            .filter_by_id(|id| id.as_str().starts_with("sensor"))
            .stop_after_timeout(Duration::from_millis(50));
        let devices: Vec<_> = scanner.scan(config).await.unwrap().collect().await;
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_ends_device_streams() {
        let adapter = adapter();
        let mut scanner = Scanner::new(&adapter);

        let stream = scanner
            .scan(ScanConfig::default().filter_by_name(|_| false))
            .await
            .unwrap();
        scanner.stop().await.unwrap();

        let devices: Vec<_> = stream.collect().await;
        assert!(devices.is_empty());
    }
}
