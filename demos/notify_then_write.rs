//! Subscribes to every notifying characteristic of a device and answers
//! each notification with a write, only ever acting on the latest one.

use blelink::{Adapter, CharPropFlags, Config, Error, SwitchLatestExt};
use futures::stream::{self, StreamExt};

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "Bean".to_string());

    let adapter = Adapter::platform(0, Config::default()).await?;
    let device = adapter.scan_until_device_found(&name).await?;
    device.connect_wait().await?;

    let characteristics = device.characteristics().await?;
    let target = match characteristics
        .iter()
        .find(|c| c.properties().contains(CharPropFlags::WRITE))
    {
        Some(target) => target.clone(),
        None => {
            println!("{} has no writable characteristic", name);
            return device.disconnect().await;
        }
    };

    let notifications = characteristics
        .iter()
        .filter(|c| c.properties().contains(CharPropFlags::NOTIFY))
        .map(|c| c.register_and_notify(false));

    let mut replies = stream::select_all(notifications).switch_latest(move |result| {
        let target = target.clone();
        async move {
            println!("Received {:?}", result.data());
            target.write(&[0x01, 0x02]).await
        }
    });

    for _ in 0..10 {
        match replies.next().await {
            Some(result) => println!("Write finished: {:?}", result.into_result()),
            None => break,
        }
    }

    device.disconnect().await
}
