use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between a caller and the radio.
///
/// Errors are `Clone` because a single failure (a dropped link, for
/// example) is fanned out to every pending operation and subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("connection attempt timed out")]
    ConnectionTimeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("operation timed out")]
    OperationTimeout,

    #[error("payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("native error{}: {message}", code_suffix(.code))]
    Native { code: Option<i32>, message: String },

    #[error("{operation} is not supported by characteristic {characteristic}")]
    UnsupportedOperation {
        operation: &'static str,
        characteristic: Uuid,
    },

    #[error("device not found")]
    DeviceNotFound,

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("no bluetooth adapter available")]
    AdapterNotFound,
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" {}", c)).unwrap_or_default()
}

impl Error {
    pub fn native(message: impl Into<String>) -> Self {
        Error::Native {
            code: None,
            message: message.into(),
        }
    }
}

impl From<btleplug::Error> for Error {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Error::Disconnected,
            btleplug::Error::TimedOut(_) => Error::OperationTimeout,
            btleplug::Error::DeviceNotFound => Error::DeviceNotFound,
            other => Error::native(other.to_string()),
        }
    }
}
