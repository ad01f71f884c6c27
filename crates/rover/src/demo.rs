use std::time::Duration;

use embedded_hal::{delay::DelayNs, i2c::I2c};
use rover_core::DriverError;
use rover_devices::power::{PowerMonitor, PowerSample};
use rover_drive::{Direction, MotorSelector, Motors, Servo};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    config::{DemoConfig, RoverConfig},
    rig::Rig,
};

async fn pause(demo: &DemoConfig, ms: u64) {
    if !demo.skip_delays {
        sleep(Duration::from_millis(ms)).await;
    }
}

fn log_sample(sample: &PowerSample) {
    info!(
        "supply: V = {:.3} V, I = {:.3} A, P = {:.3} W (shunt {:.5} V)",
        sample.bus_voltage_v, sample.current_a, sample.power_w, sample.shunt_voltage_v
    );
}

//a failed reading is reported and the previous one stays cached
fn report<M: PowerMonitor>(monitor: &mut M) {
    match monitor.update() {
        Ok(sample) => log_sample(&sample),
        Err(err) => warn!("power reading failed: {}", err),
    }
}

///The scripted run: steering plus each motor in turn, all motors, reverse with an active brake, a steering sweep
/// and a series of supply readings.
pub async fn run<I2C, D>(rig: &mut Rig<I2C, D>, cfg: &RoverConfig) -> Result<(), DriverError>
where
    I2C: I2c,
    D: DelayNs + Clone,
{
    let demo = &cfg.demo;
    let speed = demo.speed_percent;

    let mut motors = Motors::new(&mut rig.motor_controller, rig.delay.clone(), cfg.motors)?;
    let mut servo = Servo::new(
        &mut rig.servo_controller,
        cfg.servo.channel,
        cfg.servo_geometry()?,
    )?;

    info!("steering to 150 deg, first motor at {}%", speed);
    servo.set_angle(150.0)?;
    motors.drive(MotorSelector::First, speed, Direction::Forward)?;
    report(&mut rig.monitor);
    pause(demo, demo.pause_ms).await;

    info!("steering to 90 deg, second motor at {}%", speed);
    servo.set_angle(90.0)?;
    motors.stop()?;
    motors.drive(MotorSelector::Second, speed, Direction::Forward)?;
    report(&mut rig.monitor);
    pause(demo, demo.pause_ms).await;

    info!("both motors at {}%", speed);
    motors.stop()?;
    motors.drive(MotorSelector::All, speed, Direction::Forward)?;
    report(&mut rig.monitor);
    pause(demo, demo.pause_ms).await;

    info!("full reverse, then brake");
    motors.drive(MotorSelector::All, 100.0, Direction::Reverse)?;
    pause(demo, demo.pause_ms / 3).await;
    motors.brake(1.0)?;
    report(&mut rig.monitor);

    info!("steering sweep");
    let step = Duration::from_millis(if demo.skip_delays {
        0
    } else {
        cfg.servo.sweep_step_ms
    });
    let mut delay = rig.delay.clone();
    servo.sweep(90.0, 0.0, cfg.servo.sweep_steps, step, &mut delay)?;
    servo.sweep(0.0, 180.0, cfg.servo.sweep_steps, step, &mut delay)?;
    servo.set_angle(90.0)?;

    motors.end_use()?;
    servo.relax()?;

    for reading in 1..=demo.readings {
        info!("reading {} of {}", reading, demo.readings);
        report(&mut rig.monitor);
        pause(demo, demo.reading_interval_ms).await;
    }
    if let Some(sample) = rig.monitor.last_sample() {
        info!("last supply reading:");
        log_sample(&sample);
    }
    Ok(())
}
