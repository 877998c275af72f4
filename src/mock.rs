//! Scripted in-memory [`Backend`] for tests.
//!
//! Records every native call in order, tracks how many GATT requests were
//! in flight at once, and lets a test push notifications or drop the link.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::backend::{
    Advertisement, Backend, CharacteristicId, CharacteristicInfo, DeviceId, NativeEvent,
    ServiceInfo,
};
use crate::common::{characteristics, services};
use crate::{Error, Result};

/// Scratch service exposing five read/write/notify characteristics.
pub const SCRATCH_SERVICE: Uuid = Uuid::from_u128(0xa495ff20_c5b1_4b44_b512_1370f02d74de);

pub fn scratch_characteristic(index: u8) -> Uuid {
    Uuid::from_u128(0xa495ff21_c5b1_4b44_b512_1370f02d74de + ((index as u128) << 96))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect {
        device: DeviceId,
    },
    Disconnect {
        device: DeviceId,
    },
    DiscoverServices {
        device: DeviceId,
    },
    Read {
        device: DeviceId,
        characteristic: CharacteristicId,
    },
    Write {
        device: DeviceId,
        characteristic: CharacteristicId,
        data: Vec<u8>,
        with_response: bool,
    },
    Subscribe {
        device: DeviceId,
        characteristic: CharacteristicId,
        indicate: bool,
    },
    Unsubscribe {
        device: DeviceId,
        characteristic: CharacteristicId,
    },
}

#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub id: DeviceId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<ServiceInfo>,
    pub values: HashMap<CharacteristicId, Vec<u8>>,
    pub mtu: Option<usize>,
}

impl MockPeripheral {
    pub fn new(id: &str) -> Self {
        Self {
            id: DeviceId::new(id),
            local_name: None,
            rssi: None,
            services: Vec::new(),
            values: HashMap::new(),
            mtu: Some(23),
        }
    }

    /// Battery and heart rate services with standard properties.
    pub fn sample(id: &str) -> Self {
        Self::new(id)
            .with_name("Sample Sensor")
            .with_service(
                services::BATTERY,
                vec![(
                    characteristics::BATTERY_LEVEL,
                    CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::NOTIFY,
                )],
            )
            .with_service(
                services::HEART_RATE,
                vec![
                    (
                        characteristics::HEART_RATE_MEASUREMENT,
                        CharPropFlags::NOTIFY,
                    ),
                    (characteristics::BODY_SENSOR_LOCATION, CharPropFlags::READ),
                ],
            )
            .with_value(
                CharacteristicId::new(services::BATTERY, characteristics::BATTERY_LEVEL),
                vec![87],
            )
            .with_value(
                CharacteristicId::new(services::HEART_RATE, characteristics::BODY_SENSOR_LOCATION),
                vec![1],
            )
    }

    /// The scratch service with `count` fully capable characteristics.
    pub fn scratch(id: &str, count: u8) -> Self {
        let all = CharPropFlags::READ
            | CharPropFlags::WRITE
            | CharPropFlags::WRITE_WITHOUT_RESPONSE
            | CharPropFlags::NOTIFY
            | CharPropFlags::INDICATE;
        let characteristics = (0..count)
            .map(|i| (scratch_characteristic(i), all))
            .collect();

        let mut peripheral = Self::new(id)
            .with_name("Bean")
            .with_service(SCRATCH_SERVICE, characteristics);
        for i in 0..count {
            peripheral = peripheral.with_value(
                CharacteristicId::new(SCRATCH_SERVICE, scratch_characteristic(i)),
                vec![i],
            );
        }
        peripheral
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.local_name = Some(name.to_string());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_mtu(mut self, mtu: Option<usize>) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_service(mut self, uuid: Uuid, characteristics: Vec<(Uuid, CharPropFlags)>) -> Self {
        self.services.push(ServiceInfo {
            uuid,
            characteristics: characteristics
                .into_iter()
                .map(|(uuid, properties)| CharacteristicInfo { uuid, properties })
                .collect(),
        });
        self
    }

    pub fn with_value(mut self, characteristic: CharacteristicId, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            local_name: self.local_name.clone(),
            rssi: self.rssi,
            services: self.services.iter().map(|s| s.uuid).collect(),
        }
    }
}

struct MockDevice {
    peripheral: MockPeripheral,
    connected: bool,
    subscribed: HashSet<CharacteristicId>,
    events: broadcast::Sender<NativeEvent>,
}

#[derive(Default)]
struct Script {
    operation_delay: Duration,
    connect_delay: Duration,
    hang_connects: bool,
    hang_operations: usize,
    failures: VecDeque<Error>,
}

#[derive(Default)]
struct State {
    devices: HashMap<DeviceId, MockDevice>,
    calls: Vec<MockCall>,
    script: Script,
    scan_stopper: Option<Trigger>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        let (events, _) = broadcast::channel(256);
        self.inner.state.lock().unwrap().devices.insert(
            peripheral.id.clone(),
            MockDevice {
                peripheral,
                connected: false,
                subscribed: HashSet::new(),
                events,
            },
        );
    }

    /// Every GATT request takes this long to complete.
    pub fn set_operation_delay(&self, delay: Duration) {
        self.inner.state.lock().unwrap().script.operation_delay = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.state.lock().unwrap().script.connect_delay = delay;
    }

    /// Connection attempts never complete while set.
    pub fn hang_connects(&self, hang: bool) {
        self.inner.state.lock().unwrap().script.hang_connects = hang;
    }

    /// The next `count` GATT requests never complete.
    pub fn hang_next_operations(&self, count: usize) {
        self.inner.state.lock().unwrap().script.hang_operations = count;
    }

    /// The next GATT request fails with `error`.
    pub fn fail_next_operation(&self, error: Error) {
        self.inner
            .state
            .lock()
            .unwrap()
            .script
            .failures
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.state.lock().unwrap().calls.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .devices
            .get(device)
            .map_or(false, |d| d.connected)
    }

    pub fn is_subscribed(&self, device: &DeviceId, characteristic: &CharacteristicId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .devices
            .get(device)
            .map_or(false, |d| d.subscribed.contains(characteristic))
    }

    pub fn value(&self, device: &DeviceId, characteristic: &CharacteristicId) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .devices
            .get(device)
            .and_then(|d| d.peripheral.values.get(characteristic).cloned())
    }

    /// Pushes a value change as the peripheral would. Only delivered while
    /// the characteristic is subscribed; returns whether it was.
    pub fn notify(&self, device: &DeviceId, characteristic: &CharacteristicId, value: &[u8]) -> bool {
        let state = self.inner.state.lock().unwrap();
        match state.devices.get(device) {
            Some(d) if d.connected && d.subscribed.contains(characteristic) => {
                d.events
                    .send(NativeEvent::ValueChanged {
                        characteristic: *characteristic,
                        value: value.to_vec(),
                    })
                    .ok();
                true
            }
            _ => false,
        }
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self, device: &DeviceId) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(d) = state.devices.get_mut(device) {
            d.connected = false;
            d.subscribed.clear();
            d.events.send(NativeEvent::LinkLost).ok();
        }
    }

    fn record(&self, call: MockCall) {
        log::trace!("Mock call: {:?}", call);
        self.inner.state.lock().unwrap().calls.push(call);
    }

    fn ensure_connected(&self, device: &DeviceId) -> Result<()> {
        match self.inner.state.lock().unwrap().devices.get(device) {
            Some(d) if d.connected => Ok(()),
            Some(_) => Err(Error::Disconnected),
            None => Err(Error::DeviceNotFound),
        }
    }

    /// Applies the scripted delay, hang or failure for one GATT request.
    async fn gatt_request(&self, device: &DeviceId) -> Result<()> {
        let (delay, hang, failure) = {
            let mut state = self.inner.state.lock().unwrap();
            let script = &mut state.script;
            let hang = script.hang_operations > 0;
            if hang {
                script.hang_operations -= 1;
            }
            (script.operation_delay, hang, script.failures.pop_front())
        };

        if hang {
            futures::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_connected(device)?;

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_device<T>(
        &self,
        device: &DeviceId,
        f: impl FnOnce(&mut MockDevice) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.inner.state.lock().unwrap();
        let d = state.devices.get_mut(device).ok_or(Error::DeviceNotFound)?;
        f(d)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn scan(&self, services: &[Uuid]) -> Result<BoxStream<'static, Advertisement>> {
        let services = services.to_vec();
        let advertisements: Vec<_> = {
            let state = self.inner.state.lock().unwrap();
            state
                .devices
                .values()
                .map(|d| d.peripheral.advertisement())
                .filter(|ad| services.is_empty() || ad.services.iter().any(|s| services.contains(s)))
                .collect()
        };

        let (stopper, stream) = Valved::new(stream::iter(advertisements).chain(stream::pending()));
        self.inner.state.lock().unwrap().scan_stopper = Some(stopper);

        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.inner.state.lock().unwrap().scan_stopper.take();
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        self.record(MockCall::Connect {
            device: device.clone(),
        });

        let (delay, hang) = {
            let state = self.inner.state.lock().unwrap();
            if !state.devices.contains_key(device) {
                return Err(Error::DeviceNotFound);
            }
            (state.script.connect_delay, state.script.hang_connects)
        };

        if hang {
            futures::future::pending::<()>().await;
        }
        tokio::time::sleep(delay).await;

        self.with_device(device, |d| {
            d.connected = true;
            Ok(())
        })
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        self.record(MockCall::Disconnect {
            device: device.clone(),
        });
        self.with_device(device, |d| {
            d.connected = false;
            d.subscribed.clear();
            Ok(())
        })
    }

    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>> {
        self.record(MockCall::DiscoverServices {
            device: device.clone(),
        });
        self.ensure_connected(device)?;
        self.with_device(device, |d| Ok(d.peripheral.services.clone()))
    }

    async fn read(&self, device: &DeviceId, characteristic: &CharacteristicId) -> Result<Vec<u8>> {
        self.record(MockCall::Read {
            device: device.clone(),
            characteristic: *characteristic,
        });
        let _in_flight = InFlight::enter(&self.inner);
        self.gatt_request(device).await?;

        self.with_device(device, |d| {
            d.peripheral
                .values
                .get(characteristic)
                .cloned()
                .ok_or(Error::CharacteristicNotFound(characteristic.uuid))
        })
    }

    async fn write(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.record(MockCall::Write {
            device: device.clone(),
            characteristic: *characteristic,
            data: data.to_vec(),
            with_response: write_type == WriteType::WithResponse,
        });
        let _in_flight = InFlight::enter(&self.inner);
        self.gatt_request(device).await?;

        self.with_device(device, |d| {
            d.peripheral.values.insert(*characteristic, data.to_vec());
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        indicate: bool,
    ) -> Result<()> {
        self.record(MockCall::Subscribe {
            device: device.clone(),
            characteristic: *characteristic,
            indicate,
        });
        let _in_flight = InFlight::enter(&self.inner);
        self.gatt_request(device).await?;

        self.with_device(device, |d| {
            d.subscribed.insert(*characteristic);
            Ok(())
        })
    }

    async fn unsubscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<()> {
        self.record(MockCall::Unsubscribe {
            device: device.clone(),
            characteristic: *characteristic,
        });
        let _in_flight = InFlight::enter(&self.inner);
        self.gatt_request(device).await?;

        self.with_device(device, |d| {
            d.subscribed.remove(characteristic);
            Ok(())
        })
    }

    async fn events(&self, device: &DeviceId) -> Result<BoxStream<'static, NativeEvent>> {
        let receiver = self.with_device(device, |d| Ok(d.events.subscribe()))?;
        Ok(BroadcastStream::new(receiver)
            .filter_map(|event| async move { event.ok() })
            .boxed())
    }

    fn mtu(&self, device: &DeviceId) -> Option<usize> {
        self.inner
            .state
            .lock()
            .unwrap()
            .devices
            .get(device)
            .and_then(|d| d.peripheral.mtu)
    }
}
