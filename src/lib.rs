//! Serialized GATT operations for BLE peripherals.
//!
//! Every read, write and subscription change on a connected device goes
//! through one queue, so the native stack only ever sees one operation in
//! flight per device. Notifications are shared between subscribers of the
//! same characteristic, and every outcome is reported as a [`GattResult`].
//!
//! ## Usage
//!
//! Find a device, subscribe to its heart rate and read its battery level:
//!
//! ```rust,no_run
//! use blelink::common::characteristics::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT};
//! use blelink::{Adapter, Config, Error};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     let adapter = Adapter::platform(0, Config::default()).await?;
//!     let device = adapter.scan_until_device_found("Polar H10").await?;
//!     device.connect_wait().await?;
//!
//!     let battery = device.characteristic(BATTERY_LEVEL).await?.unwrap();
//!     println!("Battery level: {:?}", battery.read().await.data());
//!
//!     let heart_rate = device.characteristic(HEART_RATE_MEASUREMENT).await?.unwrap();
//!     let mut values = heart_rate.subscribe();
//!     while let Some(result) = values.next().await {
//!         println!("Heart rate: {:?}", result.into_result()?);
//!     }
//!
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use btleplug::api::{CharPropFlags, WriteType};
pub use stream_cancel::{Trigger, Tripwire};

pub use adapter::Adapter;
pub use backend::{Backend, CharacteristicId, DeviceId};
pub use characteristic::{Characteristic, Request};
pub use completion::{completion, Completer, Completion, SwitchLatest, SwitchLatestExt};
pub use config::Config;
pub use device::{Device, DeviceEvent};
pub use error::{Error, Result};
pub use notification::{NotificationStream, SubscriptionState};
pub use operation::{GattResult, OperationKind, ResultKind};
pub use scanner::{ScanConfig, Scanner};
pub use service::Service;
pub use session::ConnectionState;

mod adapter;
mod characteristic;
mod completion;
mod config;
mod device;
mod error;
mod notification;
mod operation;
mod queue;
mod scanner;
mod service;
mod session;

pub mod backend;
pub mod common;
pub mod mock;
pub mod platform;
