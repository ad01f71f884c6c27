//!This is the core library for the rover I2C stack. All other rover libraries depend on this one. It holds the error
//! taxonomy and the `BusHandle` that every peripheral driver talks through.

pub mod error;

///Byte- and word-level register access to one 7-bit target on an I2C bus.
pub mod bus;

///In-memory transport and delay for tests. Enable with the `mock` feature.
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bus::BusHandle;
pub use error::DriverError;
