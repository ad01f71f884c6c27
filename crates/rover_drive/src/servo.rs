use std::time::Duration;

use embedded_hal::delay::DelayNs;
use rover_core::DriverError;
use rover_devices::pca9685::{Channel, PwmOutput, PwmPulse, PWM_MAX};
use serde::Deserialize;
use tracing::debug;

pub const MAX_ANGLE: f64 = 180.0;

///Pulse lengths for the two ends of travel and the pwm frequency they are sent at.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct ServoGeometry {
    pub min_pulse_ms: f64,
    pub max_pulse_ms: f64,
    pub frequency_hz: f64,
}

impl Default for ServoGeometry {
    fn default() -> Self {
        Self {
            min_pulse_ms: 0.5,
            max_pulse_ms: 2.5,
            frequency_hz: 50.0,
        }
    }
}

impl ServoGeometry {
    pub fn validate(&self) -> Result<(), DriverError> {
        if !self.frequency_hz.is_finite() || self.frequency_hz <= 0.0 {
            return Err(DriverError::InvalidConfig(format!(
                "servo frequency must be positive, got {}",
                self.frequency_hz
            )));
        }
        if !(self.min_pulse_ms >= 0.0 && self.min_pulse_ms < self.max_pulse_ms)
            || !self.max_pulse_ms.is_finite()
        {
            return Err(DriverError::InvalidConfig(format!(
                "servo pulse range must satisfy 0 <= min < max, got {}..{} ms",
                self.min_pulse_ms, self.max_pulse_ms
            )));
        }
        Ok(())
    }

    ///Length of one of the 4096 counts of a period, in microseconds.
    pub fn count_length_us(&self) -> f64 {
        1_000_000.0 / self.frequency_hz / 4096.0
    }

    ///Angle is saturated to [0, 180] first; NaN counts as 0.
    pub fn angle_to_pulse_ms(&self, angle: f64) -> f64 {
        let angle = if angle.is_nan() {
            0.0
        } else {
            angle.clamp(0.0, MAX_ANGLE)
        };
        self.min_pulse_ms + (angle / MAX_ANGLE) * (self.max_pulse_ms - self.min_pulse_ms)
    }

    ///Rounded to the nearest count and held to 12 bits.
    pub fn pulse_ms_to_count(&self, pulse_ms: f64) -> u16 {
        let count = (pulse_ms * 1000.0 / self.count_length_us()).round();
        if count.is_nan() {
            return 0;
        }
        count.clamp(0.0, f64::from(PWM_MAX)) as u16
    }

    pub fn angle_to_count(&self, angle: f64) -> u16 {
        self.pulse_ms_to_count(self.angle_to_pulse_ms(angle))
    }
}

///A hobby servo on one fixed channel.
pub struct Servo<P> {
    output: P,
    channel: Channel,
    geometry: ServoGeometry,
    angle: Option<f64>,
}

impl<P: PwmOutput> Servo<P> {
    pub fn new(output: P, channel: Channel, geometry: ServoGeometry) -> Result<Self, DriverError> {
        geometry.validate()?;
        Ok(Self {
            output,
            channel,
            geometry,
            angle: None,
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn geometry(&self) -> &ServoGeometry {
        &self.geometry
    }

    ///Last angle commanded, after clamping. `None` before the first move and after `relax`.
    pub fn angle(&self) -> Option<f64> {
        self.angle
    }

    ///One channel write.
    pub fn set_angle(&mut self, angle: f64) -> Result<(), DriverError> {
        let count = self.geometry.angle_to_count(angle);
        self.output
            .set_channel_pwm(self.channel, PwmPulse::off_only(count))?;
        let clamped = if angle.is_nan() {
            0.0
        } else {
            angle.clamp(0.0, MAX_ANGLE)
        };
        debug!(
            "servo on channel {} to {:.1} deg ({} counts)",
            self.channel.index(),
            clamped,
            count
        );
        self.angle = Some(clamped);
        Ok(())
    }

    ///Moves from `from` to `to` in `steps` equal increments, pausing `step_delay` between writes. Issues `steps + 1`
    /// writes and always ends exactly on `to`.
    pub fn sweep<D: DelayNs>(
        &mut self,
        from: f64,
        to: f64,
        steps: u32,
        step_delay: Duration,
        delay: &mut D,
    ) -> Result<(), DriverError> {
        let pause_us = u32::try_from(step_delay.as_micros()).unwrap_or(u32::MAX);
        for step in 0..=steps {
            let angle = if step == steps {
                to
            } else {
                from + (to - from) * f64::from(step) / f64::from(steps)
            };
            self.set_angle(angle)?;
            if step < steps {
                delay.delay_us(pause_us);
            }
        }
        Ok(())
    }

    ///Stops driving the servo (channel to 0,0), so it no longer holds position.
    pub fn relax(&mut self) -> Result<(), DriverError> {
        self.output.set_channel_pwm(self.channel, PwmPulse::OFF)?;
        self.angle = None;
        Ok(())
    }

    pub fn release(self) -> P {
        self.output
    }
}
