///The PCA9685 is an i2c device from NXP with 16 pwm output channels with 12 bit resolution.
#[cfg(feature = "pca9685")]
pub mod pca9685;

///Common contract of the power monitors: `initialize`, `update`, `last_sample`.
#[cfg(any(feature = "ina219", feature = "ads1115"))]
pub mod power;

///The INA219 is an i2c device from Texas Instruments. It measures shunt voltage and bus voltage and, once
/// calibrated, reports current and power from its own registers.
#[cfg(feature = "ina219")]
pub mod ina219;

///The ADS1115 is a 16 bit i2c ADC from Texas Instruments. Wired across a shunt and a resistor divider it stands in
/// for a power monitor, with current and power computed on the host.
#[cfg(feature = "ads1115")]
pub mod ads1115;
