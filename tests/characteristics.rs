use std::collections::HashMap;
use std::time::Duration;

use blelink::mock::{scratch_characteristic, MockBackend, MockCall, MockPeripheral, SCRATCH_SERVICE};
use blelink::{
    Adapter, Characteristic, CharacteristicId, Config, Device, DeviceId, Error, OperationKind,
    ResultKind, SubscriptionState, SwitchLatestExt, Tripwire,
};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;

const BEAN: &str = "bean";

async fn connected(mock: &MockBackend) -> (Device, Vec<Characteristic>) {
    let _ = pretty_env_logger::try_init();

    mock.add_peripheral(MockPeripheral::scratch(BEAN, 5));
    let adapter = Adapter::new(mock.clone(), Config::default());
    let device = adapter.device(DeviceId::new(BEAN));
    device.connect_wait().await.unwrap();

    let characteristics: Vec<_> = device
        .characteristics_for_service(SCRATCH_SERVICE)
        .await
        .unwrap()
        .collect()
        .await;
    (device, characteristics)
}

fn scratch_id(index: u8) -> CharacteristicId {
    CharacteristicId::new(SCRATCH_SERVICE, scratch_characteristic(index))
}

/// Keeps pushing values on every scratch characteristic; only subscribed
/// ones are delivered.
fn spawn_notifier(mock: &MockBackend) -> JoinHandle<()> {
    let mock = mock.clone();
    tokio::spawn(async move {
        for round in 0..100u8 {
            for index in 0..5 {
                mock.notify(&DeviceId::new(BEAN), &scratch_id(index), &[index, round]);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

#[tokio::test]
async fn test_characteristics_in_discovery_order() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;

    let uuids: Vec<_> = characteristics.iter().map(Characteristic::uuid).collect();
    let expected: Vec<_> = (0..5).map(scratch_characteristic).collect();
    assert_eq!(uuids, expected);
    assert!(characteristics
        .iter()
        .all(|c| c.service().map(|s| s.uuid()) == Some(SCRATCH_SERVICE)));
}

#[tokio::test]
async fn test_write_without_response_to_all() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;

    for characteristic in &characteristics {
        let result = characteristic.write_without_response(&[0x01, 0x02]).await;
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.kind(), ResultKind::WriteWithoutResponse);
    }

    let writes = mock
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(
                call,
                MockCall::Write {
                    with_response: false,
                    ..
                }
            )
        })
        .count();
    assert_eq!(writes, 5);
    assert_eq!(
        mock.value(&DeviceId::new(BEAN), &scratch_id(4)),
        Some(vec![0x01, 0x02])
    );
}

#[tokio::test]
async fn test_concurrent_writes_are_serialized() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;
    mock.set_operation_delay(Duration::from_millis(5));

    let results = join_all(characteristics.iter().map(|c| c.write(&[0x01, 0x02]))).await;

    assert!(results.iter().all(|r| r.is_success()));
    assert!(results.iter().all(|r| r.kind() == ResultKind::Write));
    assert_eq!(mock.max_in_flight(), 1);
}

#[tokio::test]
async fn test_concurrent_reads_are_serialized() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;
    mock.set_operation_delay(Duration::from_millis(5));

    let results = join_all(characteristics.iter().map(Characteristic::read)).await;

    for (index, result) in results.iter().enumerate() {
        assert_eq!(result.data(), Some(&[index as u8][..]));
        assert_eq!(result.characteristic().uuid(), scratch_characteristic(index as u8));
    }
    assert_eq!(mock.max_in_flight(), 1);
    assert_eq!(characteristics[3].value(), Some(vec![3]));
}

#[tokio::test]
async fn test_concurrent_notifications() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;

    let streams = characteristics.iter().map(|c| c.register_and_notify(true));
    let notifier = spawn_notifier(&mock);

    let results: Vec<_> = tokio::time::timeout(
        Duration::from_secs(5),
        stream::select_all(streams).take(20).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    notifier.abort();

    let mut counts = HashMap::new();
    for result in &results {
        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.kind(), ResultKind::Indication);
        *counts.entry(result.characteristic().uuid()).or_insert(0) += 1;
    }
    assert!(counts.values().filter(|count| **count >= 2).count() >= 2);

    let subscribes = mock
        .calls()
        .into_iter()
        .filter(|call| matches!(call, MockCall::Subscribe { indicate: true, .. }))
        .count();
    assert_eq!(subscribes, 5);
}

#[tokio::test]
async fn test_notification_followed_by_write() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;

    let target = characteristics[0].clone();
    let streams = characteristics.iter().map(|c| c.register_and_notify(false));
    let notifier = spawn_notifier(&mock);

    let mut replies = stream::select_all(streams).switch_latest(move |notification| {
        let target = target.clone();
        async move {
            assert!(notification.is_success());
            target.write(&[0x01]).await
        }
    });

    let reply = tokio::time::timeout(Duration::from_secs(5), replies.next())
        .await
        .unwrap()
        .unwrap();
    notifier.abort();

    assert!(reply.is_success(), "{:?}", reply.error());
    assert_eq!(reply.kind(), ResultKind::Write);
}

#[tokio::test]
async fn test_subscribers_share_one_registration() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;
    let characteristic = &characteristics[2];
    let id = DeviceId::new(BEAN);

    let mut first = characteristic.register_and_notify(false);
    let mut second = characteristic.register_and_notify(false);
    let notifier = spawn_notifier(&mock);

    assert!(first.next().await.unwrap().is_success());
    assert!(second.next().await.unwrap().is_success());
    notifier.abort();

    let count = |mock: &MockBackend, subscribe: bool| {
        mock.calls()
            .into_iter()
            .filter(|call| match call {
                MockCall::Subscribe { .. } => subscribe,
                MockCall::Unsubscribe { .. } => !subscribe,
                _ => false,
            })
            .count()
    };
    assert_eq!(count(&mock, true), 1);
    assert_eq!(characteristic.subscription_state(), SubscriptionState::Subscribed);

    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count(&mock, false), 0);
    assert!(mock.is_subscribed(&id, &scratch_id(2)));

    drop(second);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count(&mock, false), 1);
    assert!(!mock.is_subscribed(&id, &scratch_id(2)));
    assert_eq!(
        characteristic.subscription_state(),
        SubscriptionState::Unsubscribed
    );
}

#[tokio::test]
async fn test_disconnect_fails_queued_operations() {
    let mock = MockBackend::new();
    let (device, characteristics) = connected(&mock).await;
    mock.hang_next_operations(1);

    let pending: Vec<_> = characteristics
        .iter()
        .cloned()
        .map(|c| tokio::spawn(async move { c.read().await }))
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    device.disconnect().await.unwrap();

    let results = tokio::time::timeout(Duration::from_secs(1), join_all(pending))
        .await
        .unwrap();
    for result in results {
        assert_eq!(result.unwrap().error(), Some(&Error::Disconnected));
    }
}

#[tokio::test]
async fn test_rejected_operations_never_reach_the_stack() {
    let mock = MockBackend::new();
    mock.add_peripheral(MockPeripheral::sample("sensor"));
    let (_device, characteristics) = connected(&mock).await;

    let result = characteristics[0].write(&[0; 21]).await;
    assert_eq!(
        result.error(),
        Some(&Error::PayloadTooLarge { len: 21, max: 20 })
    );
    assert!(characteristics[0].write(&[0; 20]).await.is_success());

    let adapter = Adapter::new(mock.clone(), Config::default());
    let sensor = adapter.device(DeviceId::new("sensor"));
    let location = sensor
        .characteristic(blelink::common::characteristics::BODY_SENSOR_LOCATION)
        .await
        .unwrap()
        .unwrap();

    let result = location.write(&[1]).await;
    assert!(matches!(
        result.error(),
        Some(Error::UnsupportedOperation { operation: "write", .. })
    ));

    let mut notifications = location.register_and_notify(false);
    let result = notifications.next().await.unwrap();
    assert_eq!(result.kind(), ResultKind::Subscribe);
    assert!(matches!(
        result.error(),
        Some(Error::UnsupportedOperation { .. })
    ));
    assert!(notifications.next().await.is_none());

    let writes = mock
        .calls()
        .into_iter()
        .filter(|call| matches!(call, MockCall::Write { .. }))
        .count();
    assert_eq!(writes, 1);
}

#[tokio::test]
async fn test_stale_characteristic_after_reconnect() {
    let mock = MockBackend::new();
    let (device, characteristics) = connected(&mock).await;
    let stale = characteristics[1].clone();

    device.disconnect().await.unwrap();
    device.connect_wait().await.unwrap();

    assert_eq!(stale.read().await.error(), Some(&Error::Disconnected));

    let fresh = device
        .characteristic(scratch_characteristic(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.read().await.data(), Some(&[1][..]));
}

#[tokio::test]
async fn test_notification_stream_ends_on_link_loss() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;
    let characteristic = &characteristics[0];

    let mut notifications = characteristic.register_and_notify(false);
    // Polling once performs the registration.
    let _ = tokio::time::timeout(Duration::from_millis(50), notifications.next()).await;
    assert_eq!(characteristic.subscription_state(), SubscriptionState::Subscribed);

    mock.drop_link(&DeviceId::new(BEAN));

    let last = tokio::time::timeout(Duration::from_secs(1), notifications.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.error(), Some(&Error::Disconnected));
    assert_eq!(last.kind(), ResultKind::Notification);
    assert!(notifications.next().await.is_none());
}

#[tokio::test]
async fn test_cancel_notification_stream() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;

    let (trigger, tripwire) = Tripwire::new();
    let mut notifications = characteristics[0].register_and_notify(false).cancel_on(tripwire);
    drop(trigger);

    let result = notifications.next().await.unwrap();
    assert_eq!(result.error(), Some(&Error::Cancelled));
    assert!(notifications.next().await.is_none());
}

#[tokio::test]
async fn test_request_timeout_and_cancellation() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;

    mock.hang_next_operations(1);
    let result = characteristics[0]
        .request(OperationKind::Read, &[])
        .timeout(Duration::from_millis(50))
        .send()
        .await;
    assert_eq!(result.error(), Some(&Error::OperationTimeout));

    mock.hang_next_operations(1);
    let (trigger, tripwire) = Tripwire::new();
    let request = characteristics[0]
        .request(OperationKind::Write, &[7])
        .cancel_on(tripwire);
    let pending = tokio::spawn(request.send());
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(trigger);

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.error(), Some(&Error::Cancelled));

    // The queue keeps going after both.
    assert!(characteristics[0].read().await.is_success());
}

#[tokio::test]
async fn test_native_failure_is_reported_as_data() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;

    mock.fail_next_operation(Error::Native {
        code: Some(133),
        message: "GATT error".into(),
    });
    let result = characteristics[0].read().await;
    assert!(!result.is_success());
    assert_eq!(
        result.error_message().as_deref(),
        Some("native error 133: GATT error")
    );

    assert!(characteristics[0].read().await.is_success());
}

#[tokio::test]
async fn test_link_loss_fails_queued_operations() {
    let mock = MockBackend::new();
    let (_device, characteristics) = connected(&mock).await;
    mock.hang_next_operations(1);

    let pending: Vec<_> = characteristics
        .iter()
        .cloned()
        .map(|c| tokio::spawn(async move { c.read().await }))
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    mock.drop_link(&DeviceId::new(BEAN));

    let results = tokio::time::timeout(Duration::from_secs(1), join_all(pending))
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    for result in results {
        assert_eq!(result.unwrap().error(), Some(&Error::Disconnected));
    }
}

#[tokio::test]
async fn test_handles_outlive_their_device() {
    let _ = pretty_env_logger::try_init();

    let mock = MockBackend::new();
    mock.add_peripheral(MockPeripheral::scratch(BEAN, 5));
    let adapter = Adapter::new(mock.clone(), Config::default());

    let characteristics = adapter
        .device(DeviceId::new(BEAN))
        .characteristics()
        .await
        .unwrap();

    let result = characteristics[0].read().await;
    assert!(result.is_success(), "{:?}", result.error());
    assert!(characteristics[0].service().is_some());
}

#[tokio::test]
async fn test_dropping_last_handle_disconnects() {
    let _ = pretty_env_logger::try_init();

    let mock = MockBackend::new();
    mock.add_peripheral(MockPeripheral::scratch(BEAN, 5));
    let adapter = Adapter::new(mock.clone(), Config::default());
    let id = DeviceId::new(BEAN);

    let characteristic = adapter
        .device(id.clone())
        .characteristic(scratch_characteristic(0))
        .await
        .unwrap()
        .unwrap();
    assert!(mock.is_connected(&id));

    drop(characteristic);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!mock.is_connected(&id));
    assert!(mock
        .calls()
        .contains(&MockCall::Disconnect { device: id.clone() }));
}
