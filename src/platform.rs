//! [`Backend`] for the host's Bluetooth stack, via btleplug.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic as BtleCharacteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter as BtleAdapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use uuid::Uuid;

use crate::backend::{
    Advertisement, Backend, CharacteristicId, CharacteristicInfo, DeviceId, NativeEvent,
    ServiceInfo,
};
use crate::{Error, Result};

type Peripherals = Arc<Mutex<HashMap<DeviceId, Peripheral>>>;

pub struct BtleplugBackend {
    _manager: Manager,
    adapter: BtleAdapter,
    peripherals: Peripherals,
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(format!("{:?}", id))
}

impl BtleplugBackend {
    /// Uses the adapter at `index`; the first one found is index 0.
    pub async fn new(index: usize) -> Result<Self> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if index >= adapters.len() {
            return Err(Error::AdapterNotFound);
        }

        let adapter = adapters.swap_remove(index);

        log::trace!("Using adapter: {:?}", adapter);

        Ok(Self {
            _manager: manager,
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn peripheral(&self, device: &DeviceId) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().unwrap().get(device) {
            return Ok(peripheral.clone());
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| &device_id(&p.id()) == device)
            .ok_or(Error::DeviceNotFound)?;

        self.peripherals
            .lock()
            .unwrap()
            .insert(device.clone(), peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        device: &DeviceId,
        id: &CharacteristicId,
    ) -> Result<(Peripheral, BtleCharacteristic)> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == id.uuid && c.service_uuid == id.service)
            .ok_or(Error::CharacteristicNotFound(id.uuid))?;
        Ok((peripheral, characteristic))
    }
}

#[async_trait]
impl Backend for BtleplugBackend {
    async fn scan(&self, services: &[Uuid]) -> Result<BoxStream<'static, Advertisement>> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                let peripherals = peripherals.clone();
                async move {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                        _ => return None,
                    };
                    let peripheral = adapter.peripheral(&id).await.ok()?;
                    let properties = peripheral.properties().await.ok().flatten();

                    let device = device_id(&id);
                    peripherals
                        .lock()
                        .unwrap()
                        .insert(device.clone(), peripheral);

                    Some(Advertisement {
                        id: device,
                        local_name: properties.as_ref().and_then(|p| p.local_name.clone()),
                        rssi: properties.as_ref().and_then(|p| p.rssi),
                        services: properties.map(|p| p.services).unwrap_or_default(),
                    })
                }
            })
            .boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(self.adapter.stop_scan().await?)
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        Ok(self.peripheral(device).await?.disconnect().await?)
    }

    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>> {
        let peripheral = self.peripheral(device).await?;
        peripheral.discover_services().await?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        properties: c.properties,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn read(&self, device: &DeviceId, characteristic: &CharacteristicId) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(device, characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(device, characteristic).await?;
        Ok(peripheral.write(&characteristic, data, write_type).await?)
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        indicate: bool,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(device, characteristic).await?;
        // btleplug picks notify or indicate from the characteristic's properties.
        log::trace!(
            "Subscribing to {} (indicate requested: {})",
            characteristic.uuid,
            indicate
        );
        Ok(peripheral.subscribe(&characteristic).await?)
    }

    async fn unsubscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(device, characteristic).await?;
        Ok(peripheral.unsubscribe(&characteristic).await?)
    }

    async fn events(&self, device: &DeviceId) -> Result<BoxStream<'static, NativeEvent>> {
        let peripheral = self.peripheral(device).await?;
        let id = peripheral.id();

        let lookup = peripheral.clone();
        let values = peripheral.notifications().await?.map(move |notification| {
            let service = lookup
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == notification.uuid)
                .map_or_else(Uuid::nil, |c| c.service_uuid);

            NativeEvent::ValueChanged {
                characteristic: CharacteristicId::new(service, notification.uuid),
                value: notification.value,
            }
        });

        let link_lost = self
            .adapter
            .events()
            .await?
            .filter_map(move |event| {
                let lost = matches!(&event, CentralEvent::DeviceDisconnected(lost) if *lost == id);
                async move { lost.then(|| NativeEvent::LinkLost) }
            });

        Ok(stream::select(values, link_lost).boxed())
    }
}
