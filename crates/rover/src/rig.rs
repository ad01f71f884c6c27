use std::sync::Mutex;

use embedded_hal::{delay::DelayNs, i2c::I2c};
use embedded_hal_bus::i2c::MutexDevice;
use rover_core::{BusHandle, DriverError};
use rover_devices::{
    ads1115::Ads1115,
    ina219::Ina219,
    pca9685::Pca9685,
    power::{PowerMonitor, PowerMonitorDevice},
};
use tracing::{info, warn};

use crate::config::{PowerModel, RoverConfig};

///The three peripherals of the rover, each on its own address of one shared bus.
pub struct Rig<I2C, D> {
    pub motor_controller: Pca9685<I2C, D>,
    pub servo_controller: Pca9685<I2C, D>,
    pub monitor: PowerMonitorDevice<I2C, D>,
    pub delay: D,
    motor_prescale: u8,
    servo_prescale: u8,
}

impl<'a, B, D> Rig<MutexDevice<'a, B>, D>
where
    B: I2c,
    D: DelayNs + Clone,
{
    ///Claims every address on `bus`. Fails fast if any device is missing.
    pub fn build(bus: &'a Mutex<B>, cfg: &RoverConfig, delay: D) -> Result<Self, DriverError> {
        let path = cfg.bus.as_str();
        let motor_controller = Pca9685::new(
            BusHandle::attach(MutexDevice::new(bus), path, cfg.motor_controller.address)?,
            delay.clone(),
        );
        let servo_controller = Pca9685::new(
            BusHandle::attach(MutexDevice::new(bus), path, cfg.servo_controller.address)?,
            delay.clone(),
        );

        let power = &cfg.power;
        let monitor = match power.model {
            PowerModel::Ina219 => PowerMonitorDevice::Ina219(Ina219::new(
                BusHandle::attach(MutexDevice::new(bus), path, power.ina219.address)?,
                delay.clone(),
                power.ina219.calibration()?,
            )),
            PowerModel::Ads1115 => PowerMonitorDevice::Ads1115(Ads1115::new(
                BusHandle::attach(MutexDevice::new(bus), path, power.ads1115.address)?,
                delay.clone(),
                power.ads1115.calibration,
            )?),
        };

        info!(
            "rig on {}: motors {:#04x}, servo {:#04x}, {} {:#04x}",
            path,
            cfg.motor_controller.address,
            cfg.servo_controller.address,
            monitor.model(),
            power.address()
        );

        Ok(Self {
            motor_controller,
            servo_controller,
            monitor,
            delay,
            motor_prescale: cfg.motor_controller.prescale()?,
            servo_prescale: cfg.servo_controller.prescale()?,
        })
    }
}

impl<I2C, D> Rig<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn initialize(&mut self) -> Result<(), DriverError> {
        self.motor_controller.initialize(self.motor_prescale)?;
        self.servo_controller.initialize(self.servo_prescale)?;
        self.monitor.initialize()?;
        info!("rig initialized");
        Ok(())
    }

    ///Stops every channel on both controllers and releases all three devices. Both controllers are always
    /// attempted; the first failure is returned.
    pub fn teardown(self) -> Result<(), DriverError> {
        let motors = self.motor_controller.close();
        if let Err(err) = &motors {
            warn!("motor controller teardown failed: {}", err);
        }
        let servo = self.servo_controller.close();
        if let Err(err) = &servo {
            warn!("servo controller teardown failed: {}", err);
        }
        drop(self.monitor);
        info!("rig released");
        motors.and(servo)
    }
}
