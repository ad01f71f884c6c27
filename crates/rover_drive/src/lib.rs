//!Actuators built on a PCA9685-style pwm output: dual DC motors behind an h-bridge driver and hobby servos.

///Takes a motor selector, a speed in percent and a direction and drives the speed and direction channels of an
/// h-bridge. Also does the short active brake and zeroes the motor channels when use ends.
pub mod motor;

///Turns an angle in degrees into a pulse length on one channel, using the servo's pulse geometry.
pub mod servo;

pub use motor::{Direction, MotorChannels, MotorCommand, MotorLayout, MotorSelector, Motors};
pub use servo::{Servo, ServoGeometry};
