use embedded_hal::{delay::DelayNs, i2c::I2c};
use rover_core::{BusHandle, DriverError};
use serde::Deserialize;
use tracing::{debug, warn};

use super::power::{PowerMonitor, PowerSample};

pub const CONFIG_REGISTER: u8 = 0x00;
pub const SHUNT_VOLTAGE_REGISTER: u8 = 0x01;
pub const BUS_VOLTAGE_REGISTER: u8 = 0x02;
pub const POWER_REGISTER: u8 = 0x03;
pub const CURRENT_REGISTER: u8 = 0x04;
pub const CALIBRATION_REGISTER: u8 = 0x05;

//datasheet register weights, overridable per board
pub const DEFAULT_SHUNT_LSB_V: f64 = 10e-6;
pub const DEFAULT_BUS_LSB_V: f64 = 4e-3;
//fixed in the datasheet calibration equation
const CALIBRATION_SCALE: f64 = 0.04096;
const POWER_LSB_RATIO: f64 = 20.0;

const BUS_OVF_BIT: u16 = 0x0001;

const SETTLE_MS: u32 = 5;

const DEVICE: &str = "INA219";

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusVoltageRange {
    V16,
    V32,
}

///Shunt PGA gain and the full-scale shunt voltage it allows.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShuntGain {
    Div1Mv40,
    Div2Mv80,
    Div4Mv160,
    Div8Mv320,
}

///ADC resolution or number of averaged 12 bit samples, used for both bus and shunt ADCs.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdcResolution {
    Bits9,
    Bits10,
    Bits11,
    Bits12,
    Samples2,
    Samples4,
    Samples8,
    Samples16,
    Samples32,
    Samples64,
    Samples128,
}

impl AdcResolution {
    fn bits(self) -> u16 {
        match self {
            Self::Bits9 => 0b0000,
            Self::Bits10 => 0b0001,
            Self::Bits11 => 0b0010,
            Self::Bits12 => 0b0011,
            Self::Samples2 => 0b1001,
            Self::Samples4 => 0b1010,
            Self::Samples8 => 0b1011,
            Self::Samples16 => 0b1100,
            Self::Samples32 => 0b1101,
            Self::Samples64 => 0b1110,
            Self::Samples128 => 0b1111,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    PowerDown,
    ShuntTriggered,
    BusTriggered,
    ShuntAndBusTriggered,
    AdcOff,
    ShuntContinuous,
    BusContinuous,
    ShuntAndBusContinuous,
}

///Fields of the configuration register.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Ina219Config {
    pub bus_range: BusVoltageRange,
    pub gain: ShuntGain,
    pub bus_adc: AdcResolution,
    pub shunt_adc: AdcResolution,
    pub mode: OperatingMode,
}

impl Default for Ina219Config {
    ///Power-on value, 0x399F: 32 V, /8 gain, 12 bit, continuous shunt and bus.
    fn default() -> Self {
        Self {
            bus_range: BusVoltageRange::V32,
            gain: ShuntGain::Div8Mv320,
            bus_adc: AdcResolution::Bits12,
            shunt_adc: AdcResolution::Bits12,
            mode: OperatingMode::ShuntAndBusContinuous,
        }
    }
}

impl Ina219Config {
    pub fn with_bus_range(mut self, bus_range: BusVoltageRange) -> Self {
        self.bus_range = bus_range;
        self
    }

    pub fn with_gain(mut self, gain: ShuntGain) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_bus_adc(mut self, bus_adc: AdcResolution) -> Self {
        self.bus_adc = bus_adc;
        self
    }

    pub fn with_shunt_adc(mut self, shunt_adc: AdcResolution) -> Self {
        self.shunt_adc = shunt_adc;
        self
    }

    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn bits(&self) -> u16 {
        let range = match self.bus_range {
            BusVoltageRange::V16 => 0,
            BusVoltageRange::V32 => 1,
        };
        let gain = match self.gain {
            ShuntGain::Div1Mv40 => 0b00,
            ShuntGain::Div2Mv80 => 0b01,
            ShuntGain::Div4Mv160 => 0b10,
            ShuntGain::Div8Mv320 => 0b11,
        };
        let mode = match self.mode {
            OperatingMode::PowerDown => 0b000,
            OperatingMode::ShuntTriggered => 0b001,
            OperatingMode::BusTriggered => 0b010,
            OperatingMode::ShuntAndBusTriggered => 0b011,
            OperatingMode::AdcOff => 0b100,
            OperatingMode::ShuntContinuous => 0b101,
            OperatingMode::BusContinuous => 0b110,
            OperatingMode::ShuntAndBusContinuous => 0b111,
        };
        (range << 13)
            | (gain << 11)
            | (self.bus_adc.bits() << 7)
            | (self.shunt_adc.bits() << 3)
            | mode
    }
}

///Configuration word, calibration word and the scale factors that follow from them.
///
/// Current and power LSBs are both derived from the calibration value, so the only way to build one is through a
/// constructor that computes all of them together.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ina219Calibration {
    config: Ina219Config,
    calibration: u16,
    shunt_ohms: f64,
    current_lsb_a: f64,
    power_lsb_w: f64,
    shunt_lsb_v: f64,
    bus_lsb_v: f64,
}

impl Ina219Calibration {
    ///From a known calibration register value, as written by existing firmware.
    pub fn from_register(
        config: Ina219Config,
        calibration: u16,
        shunt_ohms: f64,
    ) -> Result<Self, DriverError> {
        if !shunt_ohms.is_finite() || shunt_ohms <= 0.0 {
            return Err(DriverError::InvalidConfig(format!(
                "shunt resistance must be positive, got {shunt_ohms}"
            )));
        }
        if calibration == 0 {
            return Err(DriverError::config("INA219 calibration must be non-zero"));
        }
        let current_lsb_a = CALIBRATION_SCALE / (f64::from(calibration) * shunt_ohms);
        Ok(Self {
            config,
            calibration,
            shunt_ohms,
            current_lsb_a,
            power_lsb_w: POWER_LSB_RATIO * current_lsb_a,
            shunt_lsb_v: DEFAULT_SHUNT_LSB_V,
            bus_lsb_v: DEFAULT_BUS_LSB_V,
        })
    }

    ///Replaces the per-bit shunt and bus voltage weights, e.g. for a board with a trimmed divider on the bus input.
    pub fn with_voltage_lsbs(
        mut self,
        shunt_lsb_v: f64,
        bus_lsb_v: f64,
    ) -> Result<Self, DriverError> {
        for (name, lsb) in [("shunt", shunt_lsb_v), ("bus", bus_lsb_v)] {
            if !lsb.is_finite() || lsb <= 0.0 {
                return Err(DriverError::InvalidConfig(format!(
                    "{name} voltage lsb must be positive, got {lsb}"
                )));
            }
        }
        self.shunt_lsb_v = shunt_lsb_v;
        self.bus_lsb_v = bus_lsb_v;
        Ok(self)
    }

    ///Picks the calibration value so that `max_current_a` maps onto the full signed 15 bit current range.
    pub fn from_max_current(
        config: Ina219Config,
        shunt_ohms: f64,
        max_current_a: f64,
    ) -> Result<Self, DriverError> {
        if !max_current_a.is_finite() || max_current_a <= 0.0 {
            return Err(DriverError::InvalidConfig(format!(
                "max current must be positive, got {max_current_a}"
            )));
        }
        if !shunt_ohms.is_finite() || shunt_ohms <= 0.0 {
            return Err(DriverError::InvalidConfig(format!(
                "shunt resistance must be positive, got {shunt_ohms}"
            )));
        }
        let current_lsb = max_current_a / 32768.0;
        let calibration = (CALIBRATION_SCALE / (current_lsb * shunt_ohms)).trunc();
        if calibration < 1.0 || calibration > f64::from(u16::MAX) {
            return Err(DriverError::InvalidConfig(format!(
                "{max_current_a} A through {shunt_ohms} ohm gives calibration {calibration}, outside the register"
            )));
        }
        Self::from_register(config, calibration as u16, shunt_ohms)
    }

    pub fn config(&self) -> Ina219Config {
        self.config
    }

    pub fn calibration(&self) -> u16 {
        self.calibration
    }

    pub fn shunt_ohms(&self) -> f64 {
        self.shunt_ohms
    }

    pub fn current_lsb_a(&self) -> f64 {
        self.current_lsb_a
    }

    pub fn power_lsb_w(&self) -> f64 {
        self.power_lsb_w
    }

    pub fn shunt_lsb_v(&self) -> f64 {
        self.shunt_lsb_v
    }

    pub fn bus_lsb_v(&self) -> f64 {
        self.bus_lsb_v
    }

    ///Converts the four measurement registers. Returns the sample and whether the math overflow flag was set.
    pub fn convert(&self, shunt: u16, bus: u16, current: u16, power: u16) -> (PowerSample, bool) {
        let sample = PowerSample {
            shunt_voltage_v: f64::from(shunt as i16) * self.shunt_lsb_v,
            bus_voltage_v: f64::from(bus >> 3) * self.bus_lsb_v,
            current_a: f64::from(current as i16) * self.current_lsb_a,
            power_w: f64::from(power) * self.power_lsb_w,
        };
        (sample, bus & BUS_OVF_BIT != 0)
    }
}

//serde side of the calibration; turned into Ina219Calibration by `calibration()`
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Ina219Settings {
    pub address: u8,
    pub config: Ina219Config,
    pub shunt_ohms: f64,
    ///Raw calibration register value. Ignored when `max_current_a` is set.
    pub calibration: u16,
    pub max_current_a: Option<f64>,
    pub shunt_lsb_v: f64,
    pub bus_lsb_v: f64,
}

impl Default for Ina219Settings {
    fn default() -> Self {
        Self {
            address: 0x41,
            config: Ina219Config::default(),
            shunt_ohms: 0.1,
            calibration: 2239,
            max_current_a: None,
            shunt_lsb_v: DEFAULT_SHUNT_LSB_V,
            bus_lsb_v: DEFAULT_BUS_LSB_V,
        }
    }
}

impl Ina219Settings {
    pub fn calibration(&self) -> Result<Ina219Calibration, DriverError> {
        let calibration = match self.max_current_a {
            Some(max_current_a) => {
                Ina219Calibration::from_max_current(self.config, self.shunt_ohms, max_current_a)?
            }
            None => Ina219Calibration::from_register(self.config, self.calibration, self.shunt_ohms)?,
        };
        calibration.with_voltage_lsbs(self.shunt_lsb_v, self.bus_lsb_v)
    }
}

pub struct Ina219<I2C, D> {
    bus: BusHandle<I2C>,
    delay: D,
    calibration: Ina219Calibration,
    initialized: bool,
    last_sample: Option<PowerSample>,
}

impl<I2C, D> Ina219<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(bus: BusHandle<I2C>, delay: D, calibration: Ina219Calibration) -> Self {
        Self {
            bus,
            delay,
            calibration,
            initialized: false,
            last_sample: None,
        }
    }

    pub fn calibration(&self) -> &Ina219Calibration {
        &self.calibration
    }

    pub fn address(&self) -> u8 {
        self.bus.address()
    }

    pub fn release(self) -> BusHandle<I2C> {
        self.bus
    }
}

impl<I2C, D> PowerMonitor for Ina219<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    fn initialize(&mut self) -> Result<(), DriverError> {
        self.initialized = false;
        let config = self.calibration.config.bits();
        self.bus.write_register16(CONFIG_REGISTER, config)?;
        self.bus
            .write_register16(CALIBRATION_REGISTER, self.calibration.calibration)?;
        self.delay.delay_ms(SETTLE_MS);
        self.initialized = true;
        debug!(
            "INA219 at {:#04x} configured: config {:#06x}, calibration {}, current lsb {:.3e} A",
            self.bus.address(),
            config,
            self.calibration.calibration,
            self.calibration.current_lsb_a
        );
        Ok(())
    }

    fn update(&mut self) -> Result<PowerSample, DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized { device: DEVICE });
        }
        let shunt = self.bus.read_register16(SHUNT_VOLTAGE_REGISTER)?;
        let bus = self.bus.read_register16(BUS_VOLTAGE_REGISTER)?;
        let current = self.bus.read_register16(CURRENT_REGISTER)?;
        let power = self.bus.read_register16(POWER_REGISTER)?;

        let (sample, overflow) = self.calibration.convert(shunt, bus, current, power);
        if overflow {
            warn!(
                "INA219 at {:#04x} reports math overflow, current and power are not valid",
                self.bus.address()
            );
        }
        self.last_sample = Some(sample);
        Ok(sample)
    }

    fn last_sample(&self) -> Option<PowerSample> {
        self.last_sample
    }
}
