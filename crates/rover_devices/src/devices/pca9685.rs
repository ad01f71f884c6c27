use embedded_hal::{delay::DelayNs, i2c::I2c};
use rover_core::{BusHandle, DriverError};
use serde::Deserialize;
use tracing::{debug, warn};

pub const MODE1_REGISTER: u8 = 0x00;
pub const MODE2_REGISTER: u8 = 0x01;
pub const LED0_ON_L_REGISTER: u8 = 0x06;
pub const PRESCALE_REGISTER: u8 = 0xFE;

const MODE1_NORMAL: u8 = 0x00;
const MODE1_SLEEP: u8 = 0x10;
const MODE1_RESTART: u8 = 0x80;
const MODE2_TOTEM_POLE: u8 = 0x04;

///Largest 12 bit count. An off count of 4095 is the "fully on" pulse.
pub const PWM_MAX: u16 = 4095;
pub const CHANNEL_COUNT: u8 = 16;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
const PRESCALE_MIN: u8 = 3;

//oscillator wake-up is 500us max; every mode change gets the same margin
const SETTLE_MS: u32 = 5;

const DEVICE: &str = "PCA9685";

///One of the 16 outputs of the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "u8")]
pub struct Channel(u8);

impl Channel {
    ///Channel `index % 16`. Meant for fixed layouts known at compile time.
    pub const fn wrapping(index: u8) -> Channel {
        Channel(index % CHANNEL_COUNT)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    ///Channels 0 to 15 in order.
    pub fn all() -> impl Iterator<Item = Channel> {
        (0..CHANNEL_COUNT).map(Channel)
    }

    fn base_register(self) -> u8 {
        LED0_ON_L_REGISTER + 4 * self.0
    }
}

impl TryFrom<u8> for Channel {
    type Error = DriverError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value < CHANNEL_COUNT {
            Ok(Channel(value))
        } else {
            Err(DriverError::InvalidChannel(value))
        }
    }
}

///A 12 bit on/off pair. This driver always starts the pulse at count 0, so `off` is the pulse length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmPulse {
    on: u16,
    off: u16,
}

impl PwmPulse {
    pub const OFF: PwmPulse = PwmPulse { on: 0, off: 0 };
    pub const FULL: PwmPulse = PwmPulse {
        on: 0,
        off: PWM_MAX,
    };

    pub fn new(on: u16, off: u16) -> Result<Self, DriverError> {
        if on > PWM_MAX || off > PWM_MAX {
            return Err(DriverError::InvalidConfig(format!(
                "pwm counts must be <= {PWM_MAX}, got on={on} off={off}"
            )));
        }
        Ok(Self { on, off })
    }

    ///A pulse starting at 0 and ending at `off`, saturated to 12 bits.
    pub fn off_only(off: u16) -> Self {
        Self {
            on: 0,
            off: off.min(PWM_MAX),
        }
    }

    pub fn on(&self) -> u16 {
        self.on
    }

    pub fn off(&self) -> u16 {
        self.off
    }

    ///ON_L, ON_H, OFF_L, OFF_H
    pub fn to_register_bytes(self) -> [u8; 4] {
        let [on_h, on_l] = self.on.to_be_bytes();
        let [off_h, off_l] = self.off.to_be_bytes();
        [on_l, on_h, off_l, off_h]
    }

    ///Inverse of `to_register_bytes`. The full-on/full-off flag bits above the 12 bit count are dropped.
    pub fn from_register_bytes(bytes: [u8; 4]) -> Self {
        let [on_l, on_h, off_l, off_h] = bytes;
        Self {
            on: u16::from_be_bytes([on_h & 0x0F, on_l]),
            off: u16::from_be_bytes([off_h & 0x0F, off_l]),
        }
    }
}

///Maps a duty fraction onto a pulse. Anything at or below 0 (and NaN) is fully off, anything at or above 1 is fully
/// on.
pub fn duty_to_pulse(fraction: f64) -> PwmPulse {
    if fraction.is_nan() || fraction <= 0.0 {
        PwmPulse::OFF
    } else if fraction >= 1.0 {
        PwmPulse::FULL
    } else {
        PwmPulse::off_only((fraction * f64::from(PWM_MAX)).round() as u16)
    }
}

///Prescaler for an output frequency: `round(25 MHz / (4096 * f)) - 1`, clamped to what the chip accepts.
pub fn prescale_for_frequency(frequency_hz: f64) -> Result<u8, DriverError> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(DriverError::InvalidConfig(format!(
            "pwm frequency must be positive, got {frequency_hz}"
        )));
    }
    let raw = (OSCILLATOR_HZ / (4096.0 * frequency_hz)).round() - 1.0;
    let clamped = raw.clamp(f64::from(PRESCALE_MIN), f64::from(u8::MAX));
    if clamped != raw {
        warn!(
            "{} Hz is out of range for the PCA9685, using prescale {}",
            frequency_hz, clamped
        );
    }
    Ok(clamped as u8)
}

///Output frequency the chip actually produces for `prescale`.
pub fn frequency_for_prescale(prescale: u8) -> f64 {
    OSCILLATOR_HZ / (4096.0 * (f64::from(prescale.max(PRESCALE_MIN)) + 1.0))
}

//system level config -- corresponds to 1 pwm chip instance
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Pca9685Config {
    pub address: u8,
    pub frequency_hz: f64,
}

impl Default for Pca9685Config {
    fn default() -> Self {
        Self {
            address: 0x40,
            frequency_hz: 50.0,
        }
    }
}

impl Pca9685Config {
    pub fn prescale(&self) -> Result<u8, DriverError> {
        prescale_for_frequency(self.frequency_hz)
    }
}

///Anything that can drive a PCA9685-style channel. Actuators are written against this so they can own a controller
/// or borrow one (`&mut Pca9685`) that other actuators also use.
pub trait PwmOutput {
    fn set_channel_pwm(&mut self, channel: Channel, pulse: PwmPulse) -> Result<(), DriverError>;

    fn set_channel_duty(&mut self, channel: Channel, fraction: f64) -> Result<(), DriverError> {
        self.set_channel_pwm(channel, duty_to_pulse(fraction))
    }
}

impl<T: PwmOutput + ?Sized> PwmOutput for &mut T {
    fn set_channel_pwm(&mut self, channel: Channel, pulse: PwmPulse) -> Result<(), DriverError> {
        (**self).set_channel_pwm(channel, pulse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    ///Oscillator off, prescaler writable.
    Sleep,
    Normal,
}

///A connected PCA9685.
///
/// The chip holds the channel state; nothing is cached here apart from the lifecycle state and the prescaler last
/// written.
pub struct Pca9685<I2C, D> {
    bus: BusHandle<I2C>,
    delay: D,
    state: ControllerState,
    prescale: Option<u8>,
}

impl<I2C, D> Pca9685<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(bus: BusHandle<I2C>, delay: D) -> Self {
        Self {
            bus,
            delay,
            state: ControllerState::Uninitialized,
            prescale: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn prescale(&self) -> Option<u8> {
        self.prescale
    }

    pub fn address(&self) -> u8 {
        self.bus.address()
    }

    ///Brings the chip to normal mode with totem-pole outputs and the given prescaler.
    ///
    /// The prescaler can only be written while the oscillator sleeps, so the sequence is: normal mode, output
    /// driver, sleep, prescaler, restart. Every write is followed by a settle delay. On failure the controller is
    /// back to `Uninitialized` and `initialize` may be called again.
    pub fn initialize(&mut self, prescale: u8) -> Result<(), DriverError> {
        if prescale < PRESCALE_MIN {
            warn!(
                "prescale {} is below {}, the chip will use {}",
                prescale, PRESCALE_MIN, PRESCALE_MIN
            );
        }
        let res = self.run_initialize(prescale);
        if res.is_err() {
            self.state = ControllerState::Uninitialized;
            self.prescale = None;
        }
        res
    }

    fn run_initialize(&mut self, prescale: u8) -> Result<(), DriverError> {
        self.write_settled(MODE1_REGISTER, MODE1_NORMAL)?;
        self.state = ControllerState::Normal;
        self.write_settled(MODE2_REGISTER, MODE2_TOTEM_POLE)?;
        self.write_settled(MODE1_REGISTER, MODE1_SLEEP)?;
        self.state = ControllerState::Sleep;
        self.write_settled(PRESCALE_REGISTER, prescale)?;
        self.prescale = Some(prescale);
        self.write_settled(MODE1_REGISTER, MODE1_RESTART)?;
        self.state = ControllerState::Normal;
        debug!(
            "PCA9685 at {:#04x} running with prescale {} (~{:.1} Hz)",
            self.bus.address(),
            prescale,
            frequency_for_prescale(prescale)
        );
        Ok(())
    }

    fn write_settled(&mut self, reg: u8, value: u8) -> Result<(), DriverError> {
        self.bus.write_byte(reg, value)?;
        self.delay.delay_ms(SETTLE_MS);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), DriverError> {
        match (self.state, self.prescale) {
            (ControllerState::Normal, Some(_)) => Ok(()),
            _ => Err(DriverError::NotInitialized { device: DEVICE }),
        }
    }

    //ON_L, ON_H, OFF_L, OFF_H as four single register writes, in address order
    fn write_pulse(&mut self, channel: Channel, pulse: PwmPulse) -> Result<(), DriverError> {
        let base = channel.base_register();
        for (offset, value) in (0u8..).zip(pulse.to_register_bytes()) {
            self.bus.write_byte(base + offset, value)?;
        }
        Ok(())
    }

    pub fn set_channel_pwm(&mut self, channel: Channel, pulse: PwmPulse) -> Result<(), DriverError> {
        self.ensure_ready()?;
        self.write_pulse(channel, pulse)
    }

    pub fn set_channel_duty(&mut self, channel: Channel, fraction: f64) -> Result<(), DriverError> {
        self.set_channel_pwm(channel, duty_to_pulse(fraction))
    }

    ///Reads back the four registers of `channel`.
    pub fn read_channel(&mut self, channel: Channel) -> Result<PwmPulse, DriverError> {
        let base = channel.base_register();
        let mut bytes = [0u8; 4];
        for (offset, slot) in (0u8..).zip(bytes.iter_mut()) {
            *slot = self.bus.read_byte(base + offset)?;
        }
        Ok(PwmPulse::from_register_bytes(bytes))
    }

    ///Drives every channel to (0,0). This is the only safe state to leave the hardware in.
    ///
    /// Allowed in any state. All 16 channels are attempted even if some writes fail; the first failure is returned.
    pub fn stop_all(&mut self) -> Result<(), DriverError> {
        let mut first_err = None;
        for channel in Channel::all() {
            if let Err(err) = self.write_pulse(channel, PwmPulse::OFF) {
                warn!(
                    "could not stop channel {} on PCA9685 {:#04x}: {}",
                    channel.index(),
                    self.bus.address(),
                    err
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    ///Stops every channel, then releases the bus whether or not stopping succeeded.
    pub fn close(mut self) -> Result<(), DriverError> {
        let res = self.stop_all();
        drop(self.bus.release());
        res
    }

    ///Hands back the bus handle without touching the outputs.
    pub fn release(self) -> BusHandle<I2C> {
        self.bus
    }
}

impl<I2C, D> PwmOutput for Pca9685<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    fn set_channel_pwm(&mut self, channel: Channel, pulse: PwmPulse) -> Result<(), DriverError> {
        Pca9685::set_channel_pwm(self, channel, pulse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rover_core::mock::{MockBus, MockDelay};
    use std::time::Duration;

    const ADDRESS: u8 = 0x40;

    fn controller() -> (Pca9685<MockBus, MockDelay>, MockBus, MockDelay) {
        let bus = MockBus::new();
        bus.attach_byte_device(ADDRESS);
        let delay = MockDelay::new();
        let handle = BusHandle::attach(bus.clone(), "/dev/i2c-1", ADDRESS).unwrap();
        bus.clear_log();
        (Pca9685::new(handle, delay.clone()), bus, delay)
    }

    fn ready() -> (Pca9685<MockBus, MockDelay>, MockBus) {
        let (mut pca, bus, _) = controller();
        pca.initialize(121).unwrap();
        bus.clear_log();
        (pca, bus)
    }

    #[test]
    fn initialize_runs_the_five_steps_in_order() {
        let (mut pca, bus, delay) = controller();
        pca.initialize(121).unwrap();

        assert_eq!(
            bus.writes(ADDRESS),
            vec![
                vec![MODE1_REGISTER, 0x00],
                vec![MODE2_REGISTER, 0x04],
                vec![MODE1_REGISTER, 0x10],
                vec![PRESCALE_REGISTER, 121],
                vec![MODE1_REGISTER, 0x80],
            ]
        );
        assert_eq!(delay.elapsed(), Duration::from_millis(25));
        assert_eq!(pca.state(), ControllerState::Normal);
        assert_eq!(pca.prescale(), Some(121));
    }

    #[test]
    fn failed_initialize_goes_back_to_uninitialized() {
        let (mut pca, bus, _) = controller();
        bus.fail_after(3);
        assert!(matches!(
            pca.initialize(121),
            Err(DriverError::IoFailed { .. })
        ));
        assert_eq!(pca.state(), ControllerState::Uninitialized);
        assert_eq!(pca.prescale(), None);

        bus.heal();
        pca.initialize(121).unwrap();
        assert_eq!(pca.state(), ControllerState::Normal);
    }

    #[test]
    fn pwm_before_initialize_is_rejected() {
        let (mut pca, bus, _) = controller();
        let res = pca.set_channel_duty(Channel::try_from(0).unwrap(), 0.5);
        assert!(matches!(res, Err(DriverError::NotInitialized { .. })));
        assert!(bus.writes(ADDRESS).is_empty());
    }

    #[test]
    fn channel_pwm_is_four_byte_writes_from_base() {
        let (mut pca, bus) = ready();
        let pulse = PwmPulse::new(0x123, 0xABC).unwrap();
        pca.set_channel_pwm(Channel::try_from(3).unwrap(), pulse).unwrap();

        assert_eq!(
            bus.writes(ADDRESS),
            vec![
                vec![0x12, 0x23],
                vec![0x13, 0x01],
                vec![0x14, 0xBC],
                vec![0x15, 0x0A],
            ]
        );
    }

    #[test]
    fn duty_edges() {
        assert_eq!(duty_to_pulse(0.0), PwmPulse::OFF);
        assert_eq!(duty_to_pulse(-3.0), PwmPulse::OFF);
        assert_eq!(duty_to_pulse(f64::NAN), PwmPulse::OFF);
        assert_eq!(duty_to_pulse(1.0), PwmPulse::FULL);
        assert_eq!(duty_to_pulse(7.5), PwmPulse::FULL);
        assert_eq!(duty_to_pulse(0.5), PwmPulse::new(0, 2048).unwrap());
    }

    #[test]
    fn stop_all_leaves_every_channel_off() {
        let (mut pca, _bus) = ready();
        for channel in Channel::all() {
            pca.set_channel_duty(channel, 0.75).unwrap();
        }
        pca.stop_all().unwrap();
        for channel in Channel::all() {
            assert_eq!(pca.read_channel(channel).unwrap(), PwmPulse::OFF);
        }
    }

    #[test]
    fn stop_all_attempts_every_channel_and_reports_failure() {
        let (mut pca, bus) = ready();
        bus.fail_after(4);
        assert!(matches!(pca.stop_all(), Err(DriverError::IoFailed { .. })));
        assert_eq!(bus.writes(ADDRESS).len(), 4);
    }

    #[test]
    fn close_releases_even_after_failure() {
        let (pca, bus) = ready();
        bus.fail_after(0);
        assert!(pca.close().is_err());
    }

    #[test]
    fn channel_range() {
        assert!(Channel::try_from(15).is_ok());
        assert!(matches!(
            Channel::try_from(16),
            Err(DriverError::InvalidChannel(16))
        ));
        assert_eq!(Channel::all().count(), 16);
    }

    #[test]
    fn pulse_rejects_thirteen_bit_counts() {
        assert!(PwmPulse::new(4096, 0).is_err());
        assert!(PwmPulse::new(0, 4096).is_err());
        assert_eq!(PwmPulse::off_only(5000), PwmPulse::FULL);
    }

    #[test]
    fn prescale_from_frequency() {
        assert_eq!(prescale_for_frequency(50.0).unwrap(), 121);
        assert_eq!(prescale_for_frequency(1526.0).unwrap(), 3);
        assert_eq!(prescale_for_frequency(10.0).unwrap(), 255);
        assert!(prescale_for_frequency(0.0).is_err());
        assert!(prescale_for_frequency(f64::NAN).is_err());
        assert!((frequency_for_prescale(121) - 50.03).abs() < 0.01);
    }

    proptest! {
        #[test]
        fn duty_is_idempotent_on_the_wire(fraction in -1.0f64..2.0, channel in 0u8..16) {
            let (mut pca, bus) = ready();
            let channel = Channel::try_from(channel).unwrap();
            pca.set_channel_duty(channel, fraction).unwrap();
            let first = bus.writes(ADDRESS);
            bus.clear_log();
            pca.set_channel_duty(channel, fraction).unwrap();
            prop_assert_eq!(bus.writes(ADDRESS), first);
            prop_assert_eq!(pca.read_channel(channel).unwrap(), duty_to_pulse(fraction));
        }

        #[test]
        fn pulse_bytes_round_trip(on in 0u16..=PWM_MAX, off in 0u16..=PWM_MAX) {
            let pulse = PwmPulse::new(on, off).unwrap();
            prop_assert_eq!(PwmPulse::from_register_bytes(pulse.to_register_bytes()), pulse);
        }

        #[test]
        fn duty_is_always_twelve_bit(fraction in -10.0f64..10.0) {
            let pulse = duty_to_pulse(fraction);
            prop_assert_eq!(pulse.on(), 0);
            prop_assert!(pulse.off() <= PWM_MAX);
        }
    }
}
