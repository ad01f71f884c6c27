//!This library provides access to the Raspberry Pi I2C buses. It is a wrapper around the rppal library.
//!
//! The `open` and `open_bus` functions produce transports that can be handed to the drivers in `rover_devices`,
//! either directly or through an `embedded_hal_bus::i2c::MutexDevice` when several peripherals share one bus.

//transport adapter with strict length checks
pub mod i2c;

pub use i2c::{RpiI2c, RpiI2cError};
pub use rppal;

use embedded_hal::delay::DelayNs;
use rover_core::{BusHandle, DriverError};
use tracing::info;

const DEVICE_PREFIX: &str = "/dev/i2c-";

///Parses `/dev/i2c-N` into `N`.
pub fn bus_number(path: &str) -> Result<u8, DriverError> {
    path.strip_prefix(DEVICE_PREFIX)
        .and_then(|n| n.parse::<u8>().ok())
        .ok_or_else(|| DriverError::OpenFailed {
            path: path.to_string(),
            reason: format!("expected a path of the form {}N", DEVICE_PREFIX),
        })
}

///Opens the bus device node at `path` without claiming an address.
pub fn open_bus(path: &str) -> Result<RpiI2c, DriverError> {
    let bus = bus_number(path)?;
    let i2c = rppal::i2c::I2c::with_bus(bus).map_err(|err| DriverError::OpenFailed {
        path: path.to_string(),
        reason: err.to_string(),
    })?;
    info!("opened i2c bus {}", path);
    Ok(RpiI2c::new(i2c))
}

///Opens `path` and claims `address` on it. Fails fast when nothing acknowledges.
pub fn open(path: &str, address: u8) -> Result<BusHandle<RpiI2c>, DriverError> {
    BusHandle::attach(open_bus(path)?, path, address)
}

///Blocking thread sleep through `rppal::hal::Delay`. Copyable, so every driver can own one.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpiDelay;

impl DelayNs for RpiDelay {
    fn delay_ns(&mut self, ns: u32) {
        rppal::hal::Delay::new().delay_ns(ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bus_number() {
        assert_eq!(bus_number("/dev/i2c-1").unwrap(), 1);
        assert_eq!(bus_number("/dev/i2c-22").unwrap(), 22);
    }

    #[test]
    fn rejects_other_paths() {
        for path in ["/dev/spidev0.0", "/dev/i2c-", "/dev/i2c-x", "i2c-1"] {
            assert!(matches!(
                bus_number(path),
                Err(DriverError::OpenFailed { .. })
            ));
        }
    }
}
