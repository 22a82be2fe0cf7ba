//! Dead-zone bang-bang control of the two tracking motors.
//!
//! The motors hang off an Adafruit-style DC Motor HAT: a PCA9685 PWM
//! controller on I2C. M1 pans (horizontal), M2 tilts (vertical).

use crate::error::{Error, Result};
use rppal::i2c::I2c;
use std::thread;
use std::time::Duration;

pub const DEFAULT_DEAD_ZONE: i32 = 50;
pub const DEFAULT_SPEED: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// Discrete drive state of one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    Reverse,
    Stop,
    Forward,
}

/// Signed pixel displacement of the tracked face from the frame center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset {
    pub dx: i32,
    pub dy: i32,
}

/// Something that can spin a motor on an axis.
#[cfg_attr(test, mockall::automock)]
pub trait Actuator: Send {
    /// `throttle` is in [-1.0, 1.0]; 0.0 stops the motor.
    fn set_throttle(&mut self, axis: Axis, throttle: f32) -> Result<()>;
}

/// Owns the actuator hardware and the per-axis drive state.
pub struct ActuatorController {
    actuator: Option<Box<dyn Actuator>>,
    dead_zone: i32,
    speed: f32,
    horizontal: Drive,
    vertical: Drive,
}

impl ActuatorController {
    pub fn new(actuator: Box<dyn Actuator>, dead_zone: i32, speed: f32) -> Self {
        Self {
            actuator: Some(actuator),
            dead_zone,
            speed,
            horizontal: Drive::Stop,
            vertical: Drive::Stop,
        }
    }

    /// A controller with no hardware behind it. Every call is a no-op.
    pub fn unavailable(dead_zone: i32, speed: f32) -> Self {
        Self {
            actuator: None,
            dead_zone,
            speed,
            horizontal: Drive::Stop,
            vertical: Drive::Stop,
        }
    }

    /// Probe the Motor HAT and fall back to an unavailable controller.
    pub fn from_hat(bus: u8, address: u16, dead_zone: i32, speed: f32) -> Self {
        match MotorHat::open(bus, address) {
            Ok(hat) => {
                tracing::info!(bus, address, "motors initialized on M1 and M2");
                Self::new(Box::new(hat), dead_zone, speed)
            }
            Err(e) => {
                tracing::warn!(error = %e, "motors not available, tracking will not move");
                Self::unavailable(dead_zone, speed)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.actuator.is_some()
    }

    pub fn state(&self) -> (Drive, Drive) {
        (self.horizontal, self.vertical)
    }

    /// Drive both axes from a face offset.
    pub fn apply(&mut self, offset: Offset) {
        if self.actuator.is_none() {
            return;
        }
        // Face right of center: pan with reverse throttle.
        let horizontal = classify(offset.dx, self.dead_zone, Drive::Reverse, Drive::Forward);
        // Face below center: tilt with forward throttle.
        let vertical = classify(offset.dy, self.dead_zone, Drive::Forward, Drive::Reverse);
        self.drive(Axis::Horizontal, horizontal);
        self.drive(Axis::Vertical, vertical);
    }

    /// Stop both motors. Always re-issued, safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(actuator) = self.actuator.as_mut() else {
            return;
        };
        for axis in [Axis::Horizontal, Axis::Vertical] {
            if let Err(e) = actuator.set_throttle(axis, 0.0) {
                tracing::warn!(?axis, error = %e, "failed to stop motor");
            }
        }
        self.horizontal = Drive::Stop;
        self.vertical = Drive::Stop;
    }

    fn drive(&mut self, axis: Axis, drive: Drive) {
        let current = match axis {
            Axis::Horizontal => self.horizontal,
            Axis::Vertical => self.vertical,
        };
        if current == drive {
            return;
        }
        let throttle = match drive {
            Drive::Reverse => -self.speed,
            Drive::Stop => 0.0,
            Drive::Forward => self.speed,
        };
        let Some(actuator) = self.actuator.as_mut() else {
            return;
        };
        match actuator.set_throttle(axis, throttle) {
            Ok(()) => match axis {
                Axis::Horizontal => self.horizontal = drive,
                Axis::Vertical => self.vertical = drive,
            },
            Err(e) => tracing::warn!(?axis, error = %e, "motor write failed"),
        }
    }
}

/// Map a signed offset to a drive using an exclusive dead zone.
fn classify(value: i32, dead_zone: i32, above: Drive, below: Drive) -> Drive {
    if value > dead_zone {
        above
    } else if value < -dead_zone {
        below
    } else {
        Drive::Stop
    }
}

// PCA9685 registers
const MODE1: u8 = 0x00;
const PRESCALE: u8 = 0xFE;
const LED0_ON_L: u8 = 0x06;
const MODE1_SLEEP: u8 = 0x10;
const MODE1_AUTO_INCREMENT: u8 = 0x20;
const MODE1_RESTART: u8 = 0x80;
const OSCILLATOR_HZ: f32 = 25_000_000.0;
const PWM_FREQUENCY_HZ: f32 = 1600.0;

/// (pwm, in1, in2) channels on the PCA9685 for each motor port.
const M1_CHANNELS: (u8, u8, u8) = (8, 9, 10);
const M2_CHANNELS: (u8, u8, u8) = (13, 11, 12);

/// Adafruit DC Motor HAT driver.
pub struct MotorHat {
    i2c: I2c,
}

impl MotorHat {
    pub fn open(bus: u8, address: u16) -> Result<Self> {
        let mut i2c = I2c::with_bus(bus).map_err(|e| Error::Motor(e.to_string()))?;
        i2c.set_slave_address(address)
            .map_err(|e| Error::Motor(e.to_string()))?;
        let mut hat = Self { i2c };
        hat.init()?;
        Ok(hat)
    }

    fn init(&mut self) -> Result<()> {
        let prescale = (OSCILLATOR_HZ / (4096.0 * PWM_FREQUENCY_HZ)).round() as u8 - 1;
        self.write(MODE1, MODE1_SLEEP)?;
        self.write(PRESCALE, prescale)?;
        self.write(MODE1, MODE1_AUTO_INCREMENT)?;
        thread::sleep(Duration::from_millis(5));
        self.write(MODE1, MODE1_AUTO_INCREMENT | MODE1_RESTART)?;

        for (pwm, in1, in2) in [M1_CHANNELS, M2_CHANNELS] {
            self.set_channel(pwm, 0xFFFF)?;
            self.set_channel(in1, 0)?;
            self.set_channel(in2, 0)?;
        }
        Ok(())
    }

    fn write(&mut self, register: u8, value: u8) -> Result<()> {
        self.i2c
            .smbus_write_byte(register, value)
            .map_err(|e| Error::Motor(e.to_string()))
    }

    /// 16-bit duty cycle, 0xFFFF is fully on.
    fn set_channel(&mut self, channel: u8, duty: u16) -> Result<()> {
        let base = LED0_ON_L + 4 * channel;
        let (on, off) = match duty {
            0xFFFF => (0x1000u16, 0u16),
            0 => (0, 0x1000),
            d => (0, d >> 4),
        };
        self.write(base, (on & 0xFF) as u8)?;
        self.write(base + 1, (on >> 8) as u8)?;
        self.write(base + 2, (off & 0xFF) as u8)?;
        self.write(base + 3, (off >> 8) as u8)
    }
}

impl Actuator for MotorHat {
    fn set_throttle(&mut self, axis: Axis, throttle: f32) -> Result<()> {
        let (_, in1, in2) = match axis {
            Axis::Horizontal => M1_CHANNELS,
            Axis::Vertical => M2_CHANNELS,
        };
        let duty = (throttle.abs().min(1.0) * 65535.0) as u16;
        if throttle > 0.0 {
            self.set_channel(in2, 0)?;
            self.set_channel(in1, duty)
        } else if throttle < 0.0 {
            self.set_channel(in1, 0)?;
            self.set_channel(in2, duty)
        } else {
            self.set_channel(in1, 0)?;
            self.set_channel(in2, 0)
        }
    }
}
