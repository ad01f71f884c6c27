use std::fmt::Debug;

use clap::Parser;
use config_rs::{Config, ConfigError, File};
use rover_core::DriverError;
use rover_devices::{
    ads1115::Ads1115Settings,
    ina219::Ina219Settings,
    pca9685::{frequency_for_prescale, Channel, Pca9685Config},
};
use rover_drive::{MotorLayout, ServoGeometry};
use serde::Deserialize;

///Drives the rover motors and steering servo and reports the supply.
#[derive(Parser, Debug)]
#[command(name = "rover")]
pub struct Cli {
    ///YAML config file. Built-in defaults are used when omitted.
    pub config: Option<String>,

    ///I2C bus device node, e.g. /dev/i2c-1
    #[arg(long)]
    pub bus: Option<String>,

    ///Address of the motor PCA9685 (0x60 or 96)
    #[arg(long, value_parser = parse_address)]
    pub motor_address: Option<u8>,

    ///Address of the servo PCA9685
    #[arg(long, value_parser = parse_address)]
    pub servo_address: Option<u8>,

    ///Address of the power monitor
    #[arg(long, value_parser = parse_address)]
    pub power_address: Option<u8>,

    ///Run the demo without the pauses between steps
    #[arg(long)]
    pub skip_demo_delays: bool,
}

///Accepts `0x41` style hex or plain decimal. Only 7-bit addresses.
pub fn parse_address(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    match parsed {
        Ok(address) if address <= 0x7F => Ok(address),
        Ok(address) => Err(format!("{address:#04x} is not a 7-bit address")),
        Err(err) => Err(format!("{s} is not an address: {err}")),
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PowerModel {
    #[default]
    Ina219,
    Ads1115,
}

///Both backends can be configured; `model` picks the one that is built.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PowerSettings {
    pub model: PowerModel,
    pub ina219: Ina219Settings,
    pub ads1115: Ads1115Settings,
}

impl PowerSettings {
    pub fn address(&self) -> u8 {
        match self.model {
            PowerModel::Ina219 => self.ina219.address,
            PowerModel::Ads1115 => self.ads1115.address,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct ServoSettings {
    pub channel: Channel,
    pub geometry: ServoGeometry,
    pub sweep_steps: u32,
    pub sweep_step_ms: u64,
}

impl Default for ServoSettings {
    fn default() -> Self {
        Self {
            channel: Channel::wrapping(0),
            geometry: ServoGeometry::default(),
            sweep_steps: 18,
            sweep_step_ms: 30,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DemoConfig {
    pub speed_percent: f64,
    pub pause_ms: u64,
    pub readings: u32,
    pub reading_interval_ms: u64,
    pub skip_delays: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            speed_percent: 50.0,
            pause_ms: 3000,
            readings: 5,
            reading_interval_ms: 1000,
            skip_delays: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RoverConfig {
    pub bus: String,
    pub motor_controller: Pca9685Config,
    pub servo_controller: Pca9685Config,
    pub motors: MotorLayout,
    pub servo: ServoSettings,
    pub power: PowerSettings,
    pub demo: DemoConfig,
}

impl RoverConfig {
    ///Rejects layouts and geometries the hardware can not honor.
    pub fn validate(&self) -> Result<(), DriverError> {
        self.motors.validate()?;
        self.servo_geometry()?;
        Ok(())
    }

    ///The servo geometry at the frequency its controller really runs at after prescaler rounding.
    ///
    /// Servo counts depend on the period, so a geometry written for another frequency than its controller's is
    /// rejected.
    pub fn servo_geometry(&self) -> Result<ServoGeometry, DriverError> {
        let geometry = self.servo.geometry;
        geometry.validate()?;
        let requested = self.servo_controller.frequency_hz;
        if geometry.frequency_hz != requested {
            return Err(DriverError::InvalidConfig(format!(
                "servo geometry is set for {} Hz but its controller runs at {} Hz",
                geometry.frequency_hz, requested
            )));
        }
        Ok(ServoGeometry {
            frequency_hz: frequency_for_prescale(self.servo_controller.prescale()?),
            ..geometry
        })
    }
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self {
            bus: "/dev/i2c-1".to_string(),
            motor_controller: Pca9685Config {
                address: 0x60,
                ..Default::default()
            },
            servo_controller: Pca9685Config::default(),
            motors: MotorLayout::default(),
            servo: ServoSettings::default(),
            power: PowerSettings::default(),
            demo: DemoConfig::default(),
        }
    }
}

///Everything that can stop the rover from starting or shutting down cleanly.
pub enum RoverBuildError {
    Message(String),
    Config(ConfigError),
    Driver(DriverError),
}

impl RoverBuildError {
    pub fn message(msg: &str) -> Self {
        RoverBuildError::Message(msg.to_string())
    }
}

impl Debug for RoverBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(message) => f.write_fmt(format_args!("RoverBuildError: {}", message)),
            Self::Config(err) => f.write_fmt(format_args!("RoverBuildError (config): {}", err)),
            Self::Driver(err) => f.write_fmt(format_args!("RoverBuildError (driver): {}", err)),
        }
    }
}

impl From<ConfigError> for RoverBuildError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<DriverError> for RoverBuildError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}

///Config file (if any), then command line overrides on top.
pub fn load(cli: &Cli) -> Result<RoverConfig, RoverBuildError> {
    let mut builder = Config::builder();
    if let Some(path) = &cli.config {
        builder = builder.add_source(File::with_name(path));
    }
    let power_address = cli.power_address.map(i64::from);
    let config = builder
        .set_override_option("bus", cli.bus.clone())?
        .set_override_option("motor_controller.address", cli.motor_address.map(i64::from))?
        .set_override_option("servo_controller.address", cli.servo_address.map(i64::from))?
        .set_override_option("power.ina219.address", power_address)?
        .set_override_option("power.ads1115.address", power_address)?
        .set_override_option("demo.skip_delays", cli.skip_demo_delays.then_some(true))?
        .build()?;
    let rover = config.try_deserialize::<RoverConfig>()?;

    rover.validate()?;
    Ok(rover)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_rs::FileFormat;
    use rover_devices::ads1115::Gain;
    use rover_drive::Direction;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("rover").chain(args.iter().copied()))
    }

    #[test]
    fn addresses_in_hex_or_decimal() {
        assert_eq!(parse_address("0x60"), Ok(0x60));
        assert_eq!(parse_address("65"), Ok(0x41));
        assert!(parse_address("0x80").is_err());
        assert!(parse_address("sixty").is_err());
    }

    #[test]
    fn defaults_without_a_file() {
        let cfg = load(&cli(&[])).unwrap();
        assert_eq!(cfg.bus, "/dev/i2c-1");
        assert_eq!(cfg.motor_controller.address, 0x60);
        assert_eq!(cfg.servo_controller.address, 0x40);
        assert_eq!(cfg.power.address(), 0x41);
        assert_eq!(cfg.motor_controller.prescale().unwrap(), 121);
        assert!(!cfg.demo.skip_delays);
    }

    #[test]
    fn command_line_overrides() {
        let cfg = load(&cli(&[
            "--bus",
            "/dev/i2c-3",
            "--motor-address",
            "0x61",
            "--servo-address",
            "0x42",
            "--power-address",
            "0x48",
            "--skip-demo-delays",
        ]))
        .unwrap();
        assert_eq!(cfg.bus, "/dev/i2c-3");
        assert_eq!(cfg.motor_controller.address, 0x61);
        assert_eq!(cfg.motor_controller.frequency_hz, 50.0);
        assert_eq!(cfg.servo_controller.address, 0x42);
        assert_eq!(cfg.power.ina219.address, 0x48);
        assert_eq!(cfg.power.ads1115.address, 0x48);
        assert!(cfg.demo.skip_delays);
    }

    #[test]
    fn yaml_file() {
        let yaml = r#"
bus: /dev/i2c-0
motor_controller:
  address: 0x60
  frequency_hz: 60
motors:
  first: { speed: 8, in1: 9, in2: 10 }
  second: { speed: 13, in1: 11, in2: 12 }
servo:
  channel: 4
  geometry: { min_pulse_ms: 1.0, max_pulse_ms: 2.0, frequency_hz: 50 }
power:
  model: Ads1115
  ads1115:
    address: 0x48
    calibration:
      shunt_ohms: 0.05
      bus: { mux: Ain3, gain: Fsr6v144 }
"#;
        let rover = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize::<RoverConfig>())
            .unwrap();
        assert_eq!(rover.bus, "/dev/i2c-0");
        assert_eq!(rover.motor_controller.frequency_hz, 60.0);
        assert_eq!(rover.motors.second.in2.index(), 12);
        assert_eq!(rover.servo.channel.index(), 4);
        assert_eq!(rover.power.model, PowerModel::Ads1115);
        assert_eq!(rover.power.address(), 0x48);
        assert_eq!(rover.power.ads1115.calibration.shunt_ohms, 0.05);
        assert_eq!(rover.power.ads1115.calibration.bus.gain, Gain::Fsr6v144);
        //untouched sections keep their defaults
        assert_eq!(rover.servo_controller.address, 0x40);
        assert_eq!(rover.demo.readings, 5);
    }

    fn from_yaml(yaml: &str) -> RoverConfig {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize::<RoverConfig>())
            .unwrap()
    }

    #[test]
    fn servo_frequency_must_match_its_controller() {
        let rover = from_yaml("servo_controller: { address: 0x40, frequency_hz: 60 }\n");
        assert!(matches!(
            rover.validate(),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn servo_geometry_follows_the_controller_period() {
        let rover = from_yaml(
            r#"
servo_controller: { address: 0x40, frequency_hz: 60 }
servo:
  geometry: { min_pulse_ms: 0.5, max_pulse_ms: 2.5, frequency_hz: 60 }
"#,
        );
        rover.validate().unwrap();
        let geometry = rover.servo_geometry().unwrap();
        assert_eq!(rover.servo_controller.prescale().unwrap(), 101);
        assert_eq!(geometry.frequency_hz, frequency_for_prescale(101));

        //the centre pulse lands within one count of 1.5 ms on the real period
        let count = geometry.angle_to_count(90.0);
        let pulse_us = f64::from(count) * geometry.count_length_us();
        assert!((pulse_us - 1500.0).abs() < geometry.count_length_us());
    }

    #[test]
    fn bad_channel_is_a_config_error() {
        let yaml = "servo:\n  channel: 16\n";
        let res = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize::<RoverConfig>());
        assert!(res.is_err());
    }

    #[test]
    fn direction_names() {
        let yaml = "selector: 2\nspeed_percent: 40\ndirection: Reverse\n";
        let command = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize::<rover_drive::MotorCommand>())
            .unwrap();
        assert_eq!(command.direction, Direction::Reverse);
        assert_eq!(command.selector, 2);
    }
}
