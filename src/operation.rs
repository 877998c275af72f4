use btleplug::api::CharPropFlags;

use crate::backend::CharacteristicId;
use crate::{Characteristic, Error, Result};

/// The GATT requests that go through the operation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    WriteWithoutResponse,
    Subscribe { indicate: bool },
    Unsubscribe,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::WriteWithoutResponse => "write without response",
            OperationKind::Subscribe { indicate: false } => "notify",
            OperationKind::Subscribe { indicate: true } => "indicate",
            OperationKind::Unsubscribe => "unsubscribe",
        }
    }

    /// Whether a characteristic with `properties` can serve this request.
    pub(crate) fn is_supported_by(&self, properties: CharPropFlags) -> bool {
        let required = match self {
            OperationKind::Read => CharPropFlags::READ,
            OperationKind::Write => CharPropFlags::WRITE,
            OperationKind::WriteWithoutResponse => CharPropFlags::WRITE_WITHOUT_RESPONSE,
            OperationKind::Subscribe { indicate: false } => CharPropFlags::NOTIFY,
            OperationKind::Subscribe { indicate: true } => CharPropFlags::INDICATE,
            OperationKind::Unsubscribe => CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
        };
        properties.intersects(required)
    }

    pub(crate) fn carries_payload(&self) -> bool {
        matches!(
            self,
            OperationKind::Write | OperationKind::WriteWithoutResponse
        )
    }
}

/// A request waiting in, or dispatched from, the operation queue.
#[derive(Debug, Clone)]
pub(crate) struct GattOperation {
    pub(crate) id: u64,
    pub(crate) generation: u64,
    pub(crate) kind: OperationKind,
    pub(crate) characteristic: CharacteristicId,
    pub(crate) payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Read,
    Write,
    WriteWithoutResponse,
    Subscribe,
    Unsubscribe,
    Notification,
    Indication,
}

impl From<OperationKind> for ResultKind {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Read => ResultKind::Read,
            OperationKind::Write => ResultKind::Write,
            OperationKind::WriteWithoutResponse => ResultKind::WriteWithoutResponse,
            OperationKind::Subscribe { .. } => ResultKind::Subscribe,
            OperationKind::Unsubscribe => ResultKind::Unsubscribe,
        }
    }
}

/// Outcome of a GATT operation or a single received notification.
///
/// Failures are carried as data so merged streams keep running after one
/// of their sources fails.
#[derive(Debug, Clone)]
pub struct GattResult {
    characteristic: Characteristic,
    kind: ResultKind,
    data: Option<Vec<u8>>,
    error: Option<Error>,
}

impl GattResult {
    pub(crate) fn success(
        characteristic: Characteristic,
        kind: ResultKind,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            characteristic,
            kind,
            data,
            error: None,
        }
    }

    pub(crate) fn failure(characteristic: Characteristic, kind: ResultKind, error: Error) -> Self {
        Self {
            characteristic,
            kind,
            data: None,
            error: Some(error),
        }
    }

    pub(crate) fn from_result(
        characteristic: Characteristic,
        kind: ResultKind,
        result: Result<Option<Vec<u8>>>,
    ) -> Self {
        match result {
            Ok(data) => Self::success(characteristic, kind, data),
            Err(error) => Self::failure(characteristic, kind, error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// The characteristic this result came from.
    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }

    pub fn into_result(self) -> Result<Option<Vec<u8>>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_operations() {
        let read_only = CharPropFlags::READ;
        assert!(OperationKind::Read.is_supported_by(read_only));
        assert!(!OperationKind::Write.is_supported_by(read_only));
        assert!(!OperationKind::Subscribe { indicate: false }.is_supported_by(read_only));

        let indicate = CharPropFlags::INDICATE;
        assert!(OperationKind::Subscribe { indicate: true }.is_supported_by(indicate));
        assert!(!OperationKind::Subscribe { indicate: false }.is_supported_by(indicate));
        assert!(OperationKind::Unsubscribe.is_supported_by(indicate));
    }

    #[test]
    fn test_payload_kinds() {
        assert!(OperationKind::Write.carries_payload());
        assert!(OperationKind::WriteWithoutResponse.carries_payload());
        assert!(!OperationKind::Read.carries_payload());
    }
}
