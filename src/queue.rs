//! Per-link serial executor for GATT requests.
//!
//! Callers enqueue from anywhere; a single dispatcher task pops operations
//! in submission order and keeps exactly one of them in flight against the
//! native stack. Timeouts, cancellation and teardown all retire the head
//! operation so the queue never stalls on a callback that does not come.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::WriteType;
use stream_cancel::{Trigger, Tripwire};
use tokio::sync::mpsc;

use crate::backend::{Backend, CharacteristicId, DeviceId};
use crate::completion::{completion, has_tripped, tripped, Completer, Completion};
use crate::operation::{GattOperation, OperationKind};
use crate::{Error, Result};

struct Queued {
    operation: GattOperation,
    completer: Completer<Option<Vec<u8>>>,
    timeout: Duration,
    cancel: Option<Tripwire>,
    /// Fires when the caller stops waiting.
    abandoned: Tripwire,
}

/// Handle to a queued operation, held by the caller.
pub(crate) struct Ticket {
    id: u64,
    completion: Completion<Option<Vec<u8>>>,
    abandon: Trigger,
}

impl Ticket {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the operation. Dropping this future before it resolves
    /// abandons the operation.
    pub(crate) async fn wait(self, cancel: Option<Tripwire>) -> Result<Option<Vec<u8>>> {
        let Ticket {
            completion, abandon, ..
        } = self;

        let result = tokio::select! {
            result = completion => result,
            _ = tripped(cancel) => Err(Error::Cancelled),
        };

        abandon.disable();
        result
    }
}

pub(crate) struct OperationQueue {
    device: DeviceId,
    generation: u64,
    sender: mpsc::UnboundedSender<Queued>,
    next_id: AtomicU64,
}

impl OperationQueue {
    /// Spawns the dispatcher. It runs until `closed` fires, after which every
    /// queued operation fails with [`Error::Disconnected`].
    pub(crate) fn start(
        backend: Arc<dyn Backend>,
        device: DeviceId,
        generation: u64,
        closed: Tripwire,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            backend,
            device: device.clone(),
            receiver,
            closed,
        };
        tokio::spawn(dispatcher.run());

        Self {
            device,
            generation,
            sender,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn enqueue(
        &self,
        kind: OperationKind,
        characteristic: CharacteristicId,
        payload: Vec<u8>,
        timeout: Duration,
        cancel: Option<Tripwire>,
    ) -> Ticket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (completer, completion) = completion();
        let (abandon, abandoned) = Tripwire::new();

        log::debug!(
            "Queueing {} #{} for {} on {}",
            kind.name(),
            id,
            characteristic,
            self.device
        );

        let queued = Queued {
            operation: GattOperation {
                id,
                generation: self.generation,
                kind,
                characteristic,
                payload,
            },
            completer,
            timeout,
            cancel,
            abandoned,
        };

        if let Err(mpsc::error::SendError(queued)) = self.sender.send(queued) {
            queued.completer.complete(Err(Error::Disconnected));
        }

        Ticket {
            id,
            completion,
            abandon,
        }
    }
}

struct Dispatcher {
    backend: Arc<dyn Backend>,
    device: DeviceId,
    receiver: mpsc::UnboundedReceiver<Queued>,
    closed: Tripwire,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let queued = tokio::select! {
                biased;
                _ = tripped(Some(self.closed.clone())) => break,
                next = self.receiver.recv() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };

            self.dispatch(queued).await;
        }

        self.receiver.close();

        let mut failed = 0;
        while let Ok(queued) = self.receiver.try_recv() {
            if queued.completer.complete(Err(Error::Disconnected)) {
                failed += 1;
            }
        }

        log::debug!(
            "Operation queue for {} closed, {} pending operations failed",
            self.device,
            failed
        );
    }

    async fn dispatch(&self, queued: Queued) {
        let Queued {
            operation,
            completer,
            timeout,
            cancel,
            abandoned,
        } = queued;

        let cancelled = completer.is_completed()
            || has_tripped(&abandoned)
            || cancel.as_ref().map_or(false, has_tripped);
        if cancelled {
            log::debug!(
                "Skipping {} #{}, cancelled before dispatch",
                operation.kind.name(),
                operation.id
            );
            completer.complete(Err(Error::Cancelled));
            return;
        }

        log::debug!(
            "Dispatching {} #{} to {} (generation {})",
            operation.kind.name(),
            operation.id,
            operation.characteristic,
            operation.generation
        );

        let result = tokio::select! {
            biased;
            _ = tripped(Some(self.closed.clone())) => Err(Error::Disconnected),
            _ = tripped(cancel) => Err(Error::Cancelled),
            _ = tripped(Some(abandoned)) => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.execute(&operation)) => {
                result.unwrap_or(Err(Error::OperationTimeout))
            }
        };

        if let Err(e) = &result {
            log::debug!("{} #{} failed: {}", operation.kind.name(), operation.id, e);
        }

        if !completer.complete(result) {
            log::warn!(
                "Discarding late result of {} #{}",
                operation.kind.name(),
                operation.id
            );
        }
    }

    async fn execute(&self, operation: &GattOperation) -> Result<Option<Vec<u8>>> {
        let backend = &self.backend;
        let device = &self.device;
        let characteristic = &operation.characteristic;

        match operation.kind {
            OperationKind::Read => backend.read(device, characteristic).await.map(Some),
            OperationKind::Write => backend
                .write(
                    device,
                    characteristic,
                    &operation.payload,
                    WriteType::WithResponse,
                )
                .await
                .map(|_| None),
            OperationKind::WriteWithoutResponse => backend
                .write(
                    device,
                    characteristic,
                    &operation.payload,
                    WriteType::WithoutResponse,
                )
                .await
                .map(|_| None),
            OperationKind::Subscribe { indicate } => backend
                .subscribe(device, characteristic, indicate)
                .await
                .map(|_| None),
            OperationKind::Unsubscribe => backend
                .unsubscribe(device, characteristic)
                .await
                .map(|_| None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{characteristics, services};
    use crate::mock::{MockBackend, MockCall, MockPeripheral};
    use futures::future::join_all;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn setup(mock: &MockBackend) -> (OperationQueue, Trigger) {
        let (trigger, closed) = Tripwire::new();
        let queue = OperationQueue::start(Arc::new(mock.clone()), DeviceId::new("dev"), 1, closed);
        (queue, trigger)
    }

    fn battery() -> CharacteristicId {
        CharacteristicId::new(services::BATTERY, characteristics::BATTERY_LEVEL)
    }

    #[tokio::test]
    async fn test_dispatches_in_submission_order_one_at_a_time() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        mock.set_operation_delay(Duration::from_millis(5));
        let (queue, _trigger) = setup(&mock);

        let tickets: Vec<_> = (0..6)
            .map(|i| {
                let kind = if i % 2 == 0 {
                    OperationKind::Read
                } else {
                    OperationKind::Write
                };
                queue.enqueue(kind, battery(), vec![i as u8], TIMEOUT, None)
            })
            .collect();
        let ids: Vec<_> = tickets.iter().map(Ticket::id).collect();

        let results = join_all(tickets.into_iter().map(|t| t.wait(None))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

        let kinds: Vec<_> = mock
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Read { .. } => Some("read"),
                MockCall::Write { .. } => Some("write"),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["read", "write", "read", "write", "read", "write"]);
        assert_eq!(mock.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_timeout_retires_head_and_proceeds() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        mock.hang_next_operations(1);
        let (queue, _trigger) = setup(&mock);

        let first = queue.enqueue(
            OperationKind::Read,
            battery(),
            vec![],
            Duration::from_millis(50),
            None,
        );
        let second = queue.enqueue(OperationKind::Read, battery(), vec![], TIMEOUT, None);

        assert_eq!(first.wait(None).await, Err(Error::OperationTimeout));
        assert!(second.wait(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_pending_operations() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        mock.hang_next_operations(1);
        let (queue, trigger) = setup(&mock);

        let tickets: Vec<_> = (0..3)
            .map(|_| queue.enqueue(OperationKind::Read, battery(), vec![], TIMEOUT, None))
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(trigger);

        let results = tokio::time::timeout(
            Duration::from_secs(1),
            join_all(tickets.into_iter().map(|t| t.wait(None))),
        )
        .await
        .unwrap();
        assert!(results.iter().all(|r| *r == Err(Error::Disconnected)));

        let late = queue.enqueue(OperationKind::Read, battery(), vec![], TIMEOUT, None);
        assert_eq!(late.wait(None).await, Err(Error::Disconnected));
    }

    #[tokio::test]
    async fn test_cancelled_operation_is_never_dispatched() {
        let mock = MockBackend::new();
        mock.add_peripheral(MockPeripheral::sample("dev"));
        mock.hang_next_operations(1);
        let (queue, _trigger) = setup(&mock);

        let head = queue.enqueue(
            OperationKind::Read,
            battery(),
            vec![],
            Duration::from_millis(100),
            None,
        );
        let (cancel, tripwire) = Tripwire::new();
        let cancelled = queue.enqueue(
            OperationKind::Write,
            battery(),
            vec![1],
            TIMEOUT,
            Some(tripwire.clone()),
        );
        drop(cancel);

        assert_eq!(cancelled.wait(Some(tripwire)).await, Err(Error::Cancelled));
        assert_eq!(head.wait(None).await, Err(Error::OperationTimeout));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!mock
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::Write { .. })));
    }
}
