//!Drivers for the fixed-function I2C peripherals on the rover. Each device sits behind its own cargo feature.
//!
//! Every driver owns a `rover_core::BusHandle` and an `embedded_hal::delay::DelayNs` for the settle and
//! conversion waits its datasheet requires. All calls are synchronous.

pub mod devices;

pub use devices::*;
