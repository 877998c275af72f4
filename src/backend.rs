//! Contract for the native Bluetooth stack.
//!
//! Everything platform specific lives behind [`Backend`]. The coordinator
//! only ever talks to the radio through this trait, so a host stack, a
//! scripted mock and a remote proxy are interchangeable.

use std::fmt;

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::Result;

/// Platform assigned identity of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A characteristic is addressed by its own UUID within its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.uuid)
    }
}

/// One advertisement report seen while scanning.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub id: DeviceId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Unsolicited events on a device's shared callback channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    ValueChanged {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    LinkLost,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Start scanning. The stream runs until [`Backend::stop_scan`] is called.
    async fn scan(&self, services: &[Uuid]) -> Result<BoxStream<'static, Advertisement>>;

    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, device: &DeviceId) -> Result<()>;

    async fn disconnect(&self, device: &DeviceId) -> Result<()>;

    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>>;

    async fn read(&self, device: &DeviceId, characteristic: &CharacteristicId) -> Result<Vec<u8>>;

    async fn write(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    async fn subscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        indicate: bool,
    ) -> Result<()>;

    async fn unsubscribe(&self, device: &DeviceId, characteristic: &CharacteristicId)
        -> Result<()>;

    /// Value changes for every characteristic of the device, plus link loss.
    ///
    /// Must be callable before the first subscribe so no value is missed.
    async fn events(&self, device: &DeviceId) -> Result<BoxStream<'static, NativeEvent>>;

    /// Negotiated ATT MTU, or `None` when the stack fragments writes itself.
    fn mtu(&self, _device: &DeviceId) -> Option<usize> {
        None
    }
}
