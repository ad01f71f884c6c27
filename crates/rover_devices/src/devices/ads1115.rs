use std::time::Duration;

use embedded_hal::{delay::DelayNs, i2c::I2c};
use rover_core::{BusHandle, DriverError};
use serde::Deserialize;
use tracing::debug;

use super::power::{PowerMonitor, PowerSample};

pub const CONVERSION_REGISTER: u8 = 0x00;
pub const CONFIG_REGISTER: u8 = 0x01;
pub const LO_THRESH_REGISTER: u8 = 0x02;
pub const HI_THRESH_REGISTER: u8 = 0x03;

const OS_START: u16 = 1 << 15;
const MODE_SINGLE_SHOT: u16 = 1 << 8;
const COMPARATOR_DISABLED: u16 = 0x0003;

const DEVICE: &str = "ADS1115";

///Input multiplexer: differential pairs first, then single-ended against GND.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMux {
    Ain0Ain1,
    Ain0Ain3,
    Ain1Ain3,
    Ain2Ain3,
    Ain0,
    Ain1,
    Ain2,
    Ain3,
}

impl InputMux {
    fn bits(self) -> u16 {
        match self {
            Self::Ain0Ain1 => 0b000,
            Self::Ain0Ain3 => 0b001,
            Self::Ain1Ain3 => 0b010,
            Self::Ain2Ain3 => 0b011,
            Self::Ain0 => 0b100,
            Self::Ain1 => 0b101,
            Self::Ain2 => 0b110,
            Self::Ain3 => 0b111,
        }
    }
}

///PGA full-scale range.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gain {
    Fsr6v144,
    Fsr4v096,
    Fsr2v048,
    Fsr1v024,
    Fsr0v512,
    Fsr0v256,
}

impl Gain {
    fn bits(self) -> u16 {
        match self {
            Self::Fsr6v144 => 0b000,
            Self::Fsr4v096 => 0b001,
            Self::Fsr2v048 => 0b010,
            Self::Fsr1v024 => 0b011,
            Self::Fsr0v512 => 0b100,
            Self::Fsr0v256 => 0b101,
        }
    }

    pub fn full_scale_volts(self) -> f64 {
        match self {
            Self::Fsr6v144 => 6.144,
            Self::Fsr4v096 => 4.096,
            Self::Fsr2v048 => 2.048,
            Self::Fsr1v024 => 1.024,
            Self::Fsr0v512 => 0.512,
            Self::Fsr0v256 => 0.256,
        }
    }

    ///Volts per count of the signed 16 bit result.
    pub fn lsb_volts(self) -> f64 {
        self.full_scale_volts() / 32768.0
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataRate {
    Sps8,
    Sps16,
    Sps32,
    Sps64,
    Sps128,
    Sps250,
    Sps475,
    Sps860,
}

impl DataRate {
    fn bits(self) -> u16 {
        match self {
            Self::Sps8 => 0b000,
            Self::Sps16 => 0b001,
            Self::Sps32 => 0b010,
            Self::Sps64 => 0b011,
            Self::Sps128 => 0b100,
            Self::Sps250 => 0b101,
            Self::Sps475 => 0b110,
            Self::Sps860 => 0b111,
        }
    }

    pub fn samples_per_second(self) -> u32 {
        match self {
            Self::Sps8 => 8,
            Self::Sps16 => 16,
            Self::Sps32 => 32,
            Self::Sps64 => 64,
            Self::Sps128 => 128,
            Self::Sps250 => 250,
            Self::Sps475 => 475,
            Self::Sps860 => 860,
        }
    }

    ///Wait between starting a single-shot conversion and reading it back: one sample period plus half again for
    /// the internal oscillator tolerance.
    pub fn conversion_time(self) -> Duration {
        Duration::from_secs_f64(1.5 / f64::from(self.samples_per_second()))
    }
}

///Contents of the configuration register. The comparator is always disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ads1115Config {
    pub start: bool,
    pub mux: InputMux,
    pub gain: Gain,
    pub single_shot: bool,
    pub data_rate: DataRate,
}

impl Ads1115Config {
    ///A word that starts one single-shot conversion.
    pub fn single_shot(mux: InputMux, gain: Gain, data_rate: DataRate) -> Self {
        Self {
            start: true,
            mux,
            gain,
            single_shot: true,
            data_rate,
        }
    }

    pub fn with_start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    pub fn bits(&self) -> u16 {
        let start = if self.start { OS_START } else { 0 };
        let mode = if self.single_shot { MODE_SINGLE_SHOT } else { 0 };
        start
            | (self.mux.bits() << 12)
            | (self.gain.bits() << 9)
            | mode
            | (self.data_rate.bits() << 5)
            | COMPARATOR_DISABLED
    }
}

///Input pair and range for one of the two measurements.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Measurement {
    pub mux: InputMux,
    pub gain: Gain,
}

///Wiring of the ADC to the supply: which inputs see the shunt and the divided bus, and the resistor values needed
/// to scale them back.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct Ads1115Calibration {
    pub shunt: Measurement,
    pub bus: Measurement,
    pub data_rate: DataRate,
    pub shunt_ohms: f64,
    pub divider_top_ohms: f64,
    pub divider_bottom_ohms: f64,
}

impl Default for Ads1115Calibration {
    fn default() -> Self {
        Self {
            shunt: Measurement {
                mux: InputMux::Ain0Ain1,
                gain: Gain::Fsr0v512,
            },
            bus: Measurement {
                mux: InputMux::Ain2,
                gain: Gain::Fsr4v096,
            },
            data_rate: DataRate::Sps128,
            shunt_ohms: 0.1,
            divider_top_ohms: 30_000.0,
            divider_bottom_ohms: 10_000.0,
        }
    }
}

impl Ads1115Calibration {
    pub fn validate(&self) -> Result<(), DriverError> {
        for (name, value) in [
            ("shunt_ohms", self.shunt_ohms),
            ("divider_top_ohms", self.divider_top_ohms),
            ("divider_bottom_ohms", self.divider_bottom_ohms),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DriverError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn divider_ratio(&self) -> f64 {
        (self.divider_top_ohms + self.divider_bottom_ohms) / self.divider_bottom_ohms
    }

    ///Turns the two raw conversion results into a sample. Power is computed here, the ADC has no power register.
    pub fn convert(&self, raw_shunt: i16, raw_bus: i16) -> PowerSample {
        let shunt_voltage_v = f64::from(raw_shunt) * self.shunt.gain.lsb_volts();
        let current_a = shunt_voltage_v / self.shunt_ohms;
        let bus_voltage_v = f64::from(raw_bus) * self.bus.gain.lsb_volts() * self.divider_ratio();
        PowerSample {
            bus_voltage_v,
            shunt_voltage_v,
            current_a,
            power_w: bus_voltage_v * current_a,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Ads1115Settings {
    pub address: u8,
    pub calibration: Ads1115Calibration,
}

impl Default for Ads1115Settings {
    fn default() -> Self {
        Self {
            address: 0x41,
            calibration: Ads1115Calibration::default(),
        }
    }
}

pub struct Ads1115<I2C, D> {
    bus: BusHandle<I2C>,
    delay: D,
    calibration: Ads1115Calibration,
    initialized: bool,
    last_sample: Option<PowerSample>,
}

impl<I2C, D> Ads1115<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(
        bus: BusHandle<I2C>,
        delay: D,
        calibration: Ads1115Calibration,
    ) -> Result<Self, DriverError> {
        calibration.validate()?;
        Ok(Self {
            bus,
            delay,
            calibration,
            initialized: false,
            last_sample: None,
        })
    }

    pub fn calibration(&self) -> &Ads1115Calibration {
        &self.calibration
    }

    pub fn address(&self) -> u8 {
        self.bus.address()
    }

    pub fn release(self) -> BusHandle<I2C> {
        self.bus
    }

    //config write, wait, result read
    fn convert_once(&mut self, measurement: Measurement) -> Result<i16, DriverError> {
        let data_rate = self.calibration.data_rate;
        let config = Ads1115Config::single_shot(measurement.mux, measurement.gain, data_rate);
        self.bus.write_register16(CONFIG_REGISTER, config.bits())?;
        let wait = data_rate.conversion_time();
        self.delay
            .delay_ns(u32::try_from(wait.as_nanos()).unwrap_or(u32::MAX));
        Ok(self.bus.read_register16(CONVERSION_REGISTER)? as i16)
    }
}

impl<I2C, D> PowerMonitor for Ads1115<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    ///Leaves the ADC idle in single-shot mode, set up for the shunt measurement.
    fn initialize(&mut self) -> Result<(), DriverError> {
        self.initialized = false;
        let shunt = self.calibration.shunt;
        let idle = Ads1115Config::single_shot(shunt.mux, shunt.gain, self.calibration.data_rate)
            .with_start(false);
        self.bus.write_register16(CONFIG_REGISTER, idle.bits())?;
        self.initialized = true;
        debug!(
            "ADS1115 at {:#04x} ready, divider ratio {:.3}, shunt {} ohm",
            self.bus.address(),
            self.calibration.divider_ratio(),
            self.calibration.shunt_ohms
        );
        Ok(())
    }

    fn update(&mut self) -> Result<PowerSample, DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized { device: DEVICE });
        }
        let raw_shunt = self.convert_once(self.calibration.shunt)?;
        let raw_bus = self.convert_once(self.calibration.bus)?;
        debug!("ADS1115 raw shunt {} raw bus {}", raw_shunt, raw_bus);

        let sample = self.calibration.convert(raw_shunt, raw_bus);
        self.last_sample = Some(sample);
        Ok(sample)
    }

    fn last_sample(&self) -> Option<PowerSample> {
        self.last_sample
    }
}
