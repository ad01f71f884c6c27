use std::time::Duration;

use embedded_hal::delay::DelayNs;
use rover_core::DriverError;
use rover_devices::pca9685::{Channel, PwmOutput, PwmPulse};
use serde::Deserialize;
use tracing::{debug, warn};

///How long both bridge inputs are held high during `brake`.
pub const BRAKE_DURATION: Duration = Duration::from_millis(100);

const DEVICE: &str = "motors";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotorSelector {
    First,
    Second,
    All,
}

impl TryFrom<u8> for MotorSelector {
    type Error = DriverError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::First),
            1 => Ok(Self::Second),
            2 => Ok(Self::All),
            _ => Err(DriverError::InvalidConfig(format!(
                "motor selector must be 0, 1 or 2, got {value}"
            ))),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

///The three channels of one h-bridge: the enable/speed input and the two direction inputs.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotorChannels {
    pub speed: Channel,
    pub in1: Channel,
    pub in2: Channel,
}

impl MotorChannels {
    fn all(&self) -> [Channel; 3] {
        [self.speed, self.in1, self.in2]
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MotorLayout {
    pub first: MotorChannels,
    pub second: MotorChannels,
}

impl Default for MotorLayout {
    //Waveshare motor driver HAT: PWMA/AIN1/AIN2 and PWMB/BIN1/BIN2
    fn default() -> Self {
        Self {
            first: MotorChannels {
                speed: Channel::wrapping(0),
                in1: Channel::wrapping(1),
                in2: Channel::wrapping(2),
            },
            second: MotorChannels {
                speed: Channel::wrapping(5),
                in1: Channel::wrapping(3),
                in2: Channel::wrapping(4),
            },
        }
    }
}

impl MotorLayout {
    ///Rejects layouts that route two functions to the same channel.
    pub fn validate(&self) -> Result<(), DriverError> {
        let channels: Vec<Channel> = self.first.all().into_iter().chain(self.second.all()).collect();
        for (i, channel) in channels.iter().enumerate() {
            if channels[i + 1..].contains(channel) {
                return Err(DriverError::InvalidConfig(format!(
                    "channel {} is used twice in the motor layout",
                    channel.index()
                )));
            }
        }
        Ok(())
    }

    fn selected(&self, selector: MotorSelector) -> Vec<MotorChannels> {
        match selector {
            MotorSelector::First => vec![self.first],
            MotorSelector::Second => vec![self.second],
            MotorSelector::All => vec![self.first, self.second],
        }
    }
}

///One `drive` call, as it would appear in a scripted sequence.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct MotorCommand {
    pub selector: u8,
    pub speed_percent: f64,
    pub direction: Direction,
}

///Percent to duty fraction, clamped to [0, 1]. NaN is treated as stopped.
pub fn speed_to_duty(speed_percent: f64) -> f64 {
    if speed_percent.is_nan() {
        0.0
    } else {
        (speed_percent / 100.0).clamp(0.0, 1.0)
    }
}

///Both motors of a dual h-bridge on one pwm output.
///
/// The output can be owned or borrowed (`&mut Pca9685`). Call `end_use` when done: it zeroes the motor channels and
/// reports whether that worked. Dropping without `end_use` still tries to zero them, but any failure can only be
/// logged.
pub struct Motors<P, D>
where
    P: PwmOutput,
    D: DelayNs,
{
    output: Option<P>,
    delay: D,
    layout: MotorLayout,
}

impl<P, D> Motors<P, D>
where
    P: PwmOutput,
    D: DelayNs,
{
    pub fn new(output: P, delay: D, layout: MotorLayout) -> Result<Self, DriverError> {
        layout.validate()?;
        Ok(Self {
            output: Some(output),
            delay,
            layout,
        })
    }

    pub fn layout(&self) -> &MotorLayout {
        &self.layout
    }

    fn output(&mut self) -> Result<&mut P, DriverError> {
        self.output
            .as_mut()
            .ok_or(DriverError::NotInitialized { device: DEVICE })
    }

    ///Sets the speed channel of each selected motor to `speed_percent` and drives the direction inputs.
    pub fn drive(
        &mut self,
        selector: MotorSelector,
        speed_percent: f64,
        direction: Direction,
    ) -> Result<(), DriverError> {
        let duty = speed_to_duty(speed_percent);
        let (in1, in2) = match direction {
            Direction::Forward => (1.0, 0.0),
            Direction::Reverse => (0.0, 1.0),
        };
        debug!("drive {:?} at {:.2} {:?}", selector, duty, direction);
        for motor in self.layout.selected(selector) {
            let output = self.output()?;
            output.set_channel_duty(motor.speed, duty)?;
            output.set_channel_duty(motor.in1, in1)?;
            output.set_channel_duty(motor.in2, in2)?;
        }
        Ok(())
    }

    pub fn execute(&mut self, command: MotorCommand) -> Result<(), DriverError> {
        let selector = MotorSelector::try_from(command.selector)?;
        self.drive(selector, command.speed_percent, command.direction)
    }

    ///Zeroes every motor channel, leaving other channels of the controller alone. Every channel is attempted; the
    /// first failure is returned.
    pub fn stop(&mut self) -> Result<(), DriverError> {
        let layout = self.layout;
        let output = self.output()?;
        let mut first_err = None;
        for channel in layout.first.all().into_iter().chain(layout.second.all()) {
            if let Err(err) = output.set_channel_pwm(channel, PwmPulse::OFF) {
                warn!("could not stop motor channel {}: {}", channel.index(), err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    ///Short active brake: both direction inputs of every motor at `intensity` (clamped to [0, 1]) for
    /// `BRAKE_DURATION`, then all motor channels to zero. Blocks for the brake duration.
    pub fn brake(&mut self, intensity: f64) -> Result<(), DriverError> {
        let duty = if intensity.is_nan() {
            0.0
        } else {
            intensity.clamp(0.0, 1.0)
        };
        debug!("brake at {:.2}", duty);
        let res = self.hold_brake(duty);
        if res.is_ok() {
            self.delay.delay_ms(BRAKE_DURATION.as_millis() as u32);
        }
        let stopped = self.stop();
        res.and(stopped)
    }

    fn hold_brake(&mut self, duty: f64) -> Result<(), DriverError> {
        let layout = self.layout;
        let output = self.output()?;
        for motor in [layout.first, layout.second] {
            output.set_channel_duty(motor.in1, duty)?;
            output.set_channel_duty(motor.in2, duty)?;
        }
        Ok(())
    }

    ///Zeroes the motor channels and lets go of the output. The output is released even if zeroing fails.
    pub fn end_use(mut self) -> Result<(), DriverError> {
        let res = self.stop();
        drop(self.output.take());
        debug!("motors released");
        res
    }
}

impl<P, D> Drop for Motors<P, D>
where
    P: PwmOutput,
    D: DelayNs,
{
    fn drop(&mut self) {
        if self.output.is_some() {
            warn!("motors dropped without end_use, stopping them");
            if let Err(err) = self.stop() {
                warn!("could not stop motors on drop: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_core::mock::MockDelay;
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    #[derive(Default)]
    struct Board {
        pulses: HashMap<u8, PwmPulse>,
        writes: usize,
        broken: bool,
    }

    //records the last pulse per channel; clones share the board
    #[derive(Clone, Default)]
    struct FakeOutput(Rc<RefCell<Board>>);

    impl FakeOutput {
        fn off(&self, index: u8) -> u16 {
            self.0
                .borrow()
                .pulses
                .get(&index)
                .map(|p| p.off())
                .unwrap_or(0)
        }

        fn writes(&self) -> usize {
            self.0.borrow().writes
        }

        fn break_bus(&self) {
            self.0.borrow_mut().broken = true;
        }
    }

    impl PwmOutput for FakeOutput {
        fn set_channel_pwm(&mut self, channel: Channel, pulse: PwmPulse) -> Result<(), DriverError> {
            let mut board = self.0.borrow_mut();
            if board.broken {
                return Err(DriverError::NotInitialized { device: "fake" });
            }
            board.writes += 1;
            board.pulses.insert(channel.index(), pulse);
            Ok(())
        }
    }

    fn motors() -> (Motors<FakeOutput, MockDelay>, FakeOutput, MockDelay) {
        let output = FakeOutput::default();
        let delay = MockDelay::new();
        let motors = Motors::new(output.clone(), delay.clone(), MotorLayout::default()).unwrap();
        (motors, output, delay)
    }

    #[test]
    fn selector_values() {
        assert_eq!(MotorSelector::try_from(0).unwrap(), MotorSelector::First);
        assert_eq!(MotorSelector::try_from(1).unwrap(), MotorSelector::Second);
        assert_eq!(MotorSelector::try_from(2).unwrap(), MotorSelector::All);
        assert!(MotorSelector::try_from(3).is_err());
    }

    #[test]
    fn speed_is_clamped() {
        assert_eq!(speed_to_duty(150.0), 1.0);
        assert_eq!(speed_to_duty(-20.0), 0.0);
        assert_eq!(speed_to_duty(f64::NAN), 0.0);
        assert_eq!(speed_to_duty(80.0), 0.8);
    }

    #[test]
    fn forward_drives_in1_high() {
        let (mut motors, output, _) = motors();
        motors
            .drive(MotorSelector::First, 50.0, Direction::Forward)
            .unwrap();
        assert_eq!(output.off(0), 2048);
        assert_eq!(output.off(1), 4095);
        assert_eq!(output.off(2), 0);
        assert_eq!(output.writes(), 3);
        //second motor untouched
        assert_eq!(output.off(5), 0);
    }

    #[test]
    fn reverse_on_all_motors() {
        let (mut motors, output, _) = motors();
        motors
            .drive(MotorSelector::All, 250.0, Direction::Reverse)
            .unwrap();
        assert_eq!(output.writes(), 6);
        for (speed, in1, in2) in [(0, 1, 2), (5, 3, 4)] {
            assert_eq!(output.off(speed), 4095);
            assert_eq!(output.off(in1), 0);
            assert_eq!(output.off(in2), 4095);
        }
    }

    #[test]
    fn brake_holds_then_zeroes() {
        let (mut motors, output, delay) = motors();
        motors
            .drive(MotorSelector::All, 80.0, Direction::Forward)
            .unwrap();
        let before = output.writes();
        motors.brake(3.0).unwrap();
        //four direction inputs at full, then six channels to zero
        assert_eq!(output.writes() - before, 4 + 6);
        assert_eq!(delay.elapsed(), BRAKE_DURATION);
        for index in 0..6 {
            assert_eq!(output.off(index), 0);
        }
    }

    #[test]
    fn stop_only_touches_motor_channels() {
        let (mut motors, mut output, _) = motors();
        output.set_channel_duty(Channel::wrapping(15), 0.5).unwrap();
        motors
            .drive(MotorSelector::All, 60.0, Direction::Forward)
            .unwrap();
        motors.stop().unwrap();
        assert_eq!(output.off(15), 2048);
        assert_eq!(output.off(0), 0);
        assert_eq!(output.off(3), 0);
    }

    #[test]
    fn drop_without_end_use_still_stops() {
        let (mut motors, output, _) = motors();
        motors
            .drive(MotorSelector::All, 100.0, Direction::Forward)
            .unwrap();
        drop(motors);
        for index in 0..6 {
            assert_eq!(output.off(index), 0);
        }
    }

    #[test]
    fn end_use_zeroes_and_surfaces_failure() {
        let (mut motors, output, _) = motors();
        motors
            .drive(MotorSelector::All, 40.0, Direction::Forward)
            .unwrap();
        motors.end_use().unwrap();
        assert_eq!(output.off(0), 0);

        let (mut motors, output, _) = self::motors();
        motors
            .drive(MotorSelector::Second, 40.0, Direction::Forward)
            .unwrap();
        output.break_bus();
        assert!(motors.end_use().is_err());
    }

    #[test]
    fn layout_rejects_shared_channels() {
        let mut layout = MotorLayout::default();
        layout.second.in1 = layout.first.speed;
        assert!(layout.validate().is_err());
        assert!(MotorLayout::default().validate().is_ok());
        assert!(Motors::new(FakeOutput::default(), MockDelay::new(), layout).is_err());
    }

    #[test]
    fn command_selector_is_checked() {
        let (mut motors, output, _) = motors();
        let bad = MotorCommand {
            selector: 7,
            speed_percent: 10.0,
            direction: Direction::Forward,
        };
        assert!(motors.execute(bad).is_err());
        assert_eq!(output.writes(), 0);
        let good = MotorCommand { selector: 1, ..bad };
        motors.execute(good).unwrap();
        assert_eq!(output.off(5), 410);
    }
}
