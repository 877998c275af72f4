//! Follows the connection events of a device while reading every readable
//! characteristic once.

use blelink::{Adapter, CharPropFlags, Config, DeviceEvent, Error};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "Bean".to_string());

    let config = Config::default().scan_timeout(std::time::Duration::from_secs(10));
    let adapter = Adapter::platform(0, config).await?;

    let mut events = adapter.events();
    let listener = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                DeviceEvent::Connected(device) => println!("Connected: {:?}", device),
                DeviceEvent::Disconnected(device) => {
                    println!("Disconnected: {}", device.id());
                    break;
                }
                DeviceEvent::Discovered(device) | DeviceEvent::Updated(device) => {
                    println!("Seen: {} ({:?} dBm)", device.id(), device.rssi())
                }
            }
        }
    });

    let device = adapter.scan_until_device_found(&name).await?;

    let mut states = device.connect(None);
    while let Some(state) = states.next().await {
        println!("State: {}", state?);
    }

    for characteristic in device.characteristics().await? {
        if !characteristic.properties().contains(CharPropFlags::READ) {
            continue;
        }
        let result = characteristic.read().await;
        match result.into_result() {
            Ok(value) => println!("{}: {:?}", characteristic.uuid(), value),
            Err(e) => println!("{}: {}", characteristic.uuid(), e),
        }
    }

    device.disconnect().await?;
    listener.await.unwrap();

    Ok(())
}
