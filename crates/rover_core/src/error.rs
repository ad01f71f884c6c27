//!A mod for the error types
use embedded_hal::i2c::{self, ErrorKind};
use thiserror::Error;

///Common error type for every driver in the workspace.
///
/// Nothing in the library crates terminates the process; every failure surfaces as one of these.
#[derive(Debug, Error)]
pub enum DriverError {
    ///The bus device node is missing, malformed or could not be opened (permissions).
    #[error("could not open i2c bus {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    ///The target address did not acknowledge, or is not a valid 7-bit address.
    #[error("device {address:#04x} on {path} did not acknowledge")]
    AddressRejected { path: String, address: u8 },

    ///A transfer on an established connection failed or came back short.
    #[error("i2c transfer with {address:#04x} failed ({kind}): {detail}")]
    IoFailed {
        address: u8,
        kind: ErrorKind,
        detail: String,
    },

    ///The device was used before `initialize` completed.
    #[error("{device} used before initialize")]
    NotInitialized { device: &'static str },

    #[error("pwm channel {0} out of range (0-15)")]
    InvalidChannel(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DriverError {
    pub fn io<E: i2c::Error>(address: u8, err: E) -> Self {
        DriverError::IoFailed {
            address,
            kind: err.kind(),
            detail: format!("{:?}", err),
        }
    }

    pub fn config(msg: &str) -> Self {
        DriverError::InvalidConfig(msg.to_string())
    }
}

