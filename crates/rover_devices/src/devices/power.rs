use rover_core::DriverError;

///One reading of the supply, in volts, amps and watts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub bus_voltage_v: f64,
    pub shunt_voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
}

///Common contract of the supply monitors.
///
/// `update` either returns a complete new sample and makes it the one reported by `last_sample`, or fails and leaves
/// the previous sample in place. Fields from different reads are never mixed.
pub trait PowerMonitor {
    ///Programs the device. Can be called again to recover after a failure.
    fn initialize(&mut self) -> Result<(), DriverError>;

    fn update(&mut self) -> Result<PowerSample, DriverError>;

    ///`None` until the first successful `update`.
    fn last_sample(&self) -> Option<PowerSample>;
}

impl<T: PowerMonitor + ?Sized> PowerMonitor for &mut T {
    fn initialize(&mut self) -> Result<(), DriverError> {
        (**self).initialize()
    }

    fn update(&mut self) -> Result<PowerSample, DriverError> {
        (**self).update()
    }

    fn last_sample(&self) -> Option<PowerSample> {
        (**self).last_sample()
    }
}

#[cfg(all(feature = "ina219", feature = "ads1115"))]
pub use dispatch::PowerMonitorDevice;

#[cfg(all(feature = "ina219", feature = "ads1115"))]
mod dispatch {
    use embedded_hal::{delay::DelayNs, i2c::I2c};
    use rover_core::DriverError;

    use super::{PowerMonitor, PowerSample};
    use crate::devices::{ads1115::Ads1115, ina219::Ina219};

    ///Either backend, picked at runtime from configuration.
    pub enum PowerMonitorDevice<I2C, D> {
        Ina219(Ina219<I2C, D>),
        Ads1115(Ads1115<I2C, D>),
    }

    impl<I2C, D> PowerMonitorDevice<I2C, D> {
        pub fn model(&self) -> &'static str {
            match self {
                Self::Ina219(_) => "INA219",
                Self::Ads1115(_) => "ADS1115",
            }
        }
    }

    impl<I2C, D> From<Ina219<I2C, D>> for PowerMonitorDevice<I2C, D> {
        fn from(dev: Ina219<I2C, D>) -> Self {
            Self::Ina219(dev)
        }
    }

    impl<I2C, D> From<Ads1115<I2C, D>> for PowerMonitorDevice<I2C, D> {
        fn from(dev: Ads1115<I2C, D>) -> Self {
            Self::Ads1115(dev)
        }
    }

    impl<I2C, D> PowerMonitor for PowerMonitorDevice<I2C, D>
    where
        I2C: I2c,
        D: DelayNs,
    {
        fn initialize(&mut self) -> Result<(), DriverError> {
            match self {
                Self::Ina219(dev) => dev.initialize(),
                Self::Ads1115(dev) => dev.initialize(),
            }
        }

        fn update(&mut self) -> Result<PowerSample, DriverError> {
            match self {
                Self::Ina219(dev) => dev.update(),
                Self::Ads1115(dev) => dev.update(),
            }
        }

        fn last_sample(&self) -> Option<PowerSample> {
            match self {
                Self::Ina219(dev) => dev.last_sample(),
                Self::Ads1115(dev) => dev.last_sample(),
            }
        }
    }
}
