// Hardware seams for the locomotion core
//
// The PWM generator and the analog feedback scanner are external collaborators:
// the core only needs a channel-indexed PWM sink and a channel-indexed millivolt
// source. Both are shared between the control tick and calibration threads, so
// every method takes `&self`; implementations keep one atomic slot per channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU16, Ordering};

use crate::clock::Clock;
use crate::config::{ANALOG_CHANNEL_COUNT, PWM_CHANNEL_COUNT, PWM_MAX_VALUE};
use crate::error::{Error, Result};

use super::store::CalibrationStore;

/// Channel-indexed PWM sink, duty values in [0, 4095]
pub trait MotorDriver: Send + Sync {
    /// Stage a duty value for a channel (0 = no pulse, servo released)
    fn set_pwm(&self, channel: u8, value: u16) -> Result<()>;

    /// Last staged duty value for a channel
    fn pwm(&self, channel: u8) -> Result<u16>;

    /// Push all staged values to the hardware
    fn flush(&self) -> Result<()>;

    /// Release every channel
    fn disable_all(&self) -> Result<()> {
        for channel in 0..PWM_CHANNEL_COUNT as u8 {
            self.set_pwm(channel, 0)?;
        }
        self.flush()
    }
}

/// Channel-indexed millivolt source
pub trait AnalogDriver: Send + Sync {
    /// Latest sampled voltage of a channel, in mV
    fn voltage(&self, channel: u8) -> Result<i32>;

    /// Advance the background scan by one step (called by the sampling tick)
    fn scan_step(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything a motor controller needs from the board
#[derive(Clone)]
pub struct Hardware {
    pub motors: Arc<dyn MotorDriver>,
    pub analog: Arc<dyn AnalogDriver>,
    pub store: Arc<dyn CalibrationStore>,
    pub clock: Arc<dyn Clock>,
}

/// Staged PWM values, one lock-free slot per channel
pub struct PwmBuffer {
    values: [AtomicU16; PWM_CHANNEL_COUNT],
}

impl PwmBuffer {
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU16::new(0)),
        }
    }

    pub fn set(&self, channel: u8, value: u16) -> Result<()> {
        let slot = self.slot(channel)?;
        if value > PWM_MAX_VALUE {
            return Err(Error::OutOfBounds(format!(
                "PWM value {} above {}",
                value, PWM_MAX_VALUE
            )));
        }
        slot.store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, channel: u8) -> Result<u16> {
        Ok(self.slot(channel)?.load(Ordering::Relaxed))
    }

    /// Copy of all channels
    pub fn snapshot(&self) -> [u16; PWM_CHANNEL_COUNT] {
        std::array::from_fn(|i| self.values[i].load(Ordering::Relaxed))
    }

    fn slot(&self, channel: u8) -> Result<&AtomicU16> {
        self.values
            .get(channel as usize)
            .ok_or_else(|| Error::InvalidParameters(format!("PWM channel {} out of range", channel)))
    }
}

impl Default for PwmBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sampled voltages, written by the scanner and read without locking
pub struct AnalogBuffer {
    values: [AtomicI32; ANALOG_CHANNEL_COUNT],
}

impl AnalogBuffer {
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicI32::new(0)),
        }
    }

    pub fn store(&self, channel: u8, millivolts: i32) -> Result<()> {
        self.slot(channel)?.store(millivolts, Ordering::Relaxed);
        Ok(())
    }

    pub fn load(&self, channel: u8) -> Result<i32> {
        Ok(self.slot(channel)?.load(Ordering::Relaxed))
    }

    fn slot(&self, channel: u8) -> Result<&AtomicI32> {
        self.values.get(channel as usize).ok_or_else(|| {
            Error::InvalidParameters(format!("Analog channel {} out of range", channel))
        })
    }
}

impl Default for AnalogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pwm_buffer_rejects_bad_channel_and_value() {
        let buf = PwmBuffer::new();
        assert!(matches!(buf.set(16, 100), Err(Error::InvalidParameters(_))));
        assert!(matches!(buf.set(3, 4096), Err(Error::OutOfBounds(_))));
        buf.set(3, 4095).unwrap();
        assert_eq!(buf.get(3).unwrap(), 4095);
        assert_eq!(buf.snapshot()[3], 4095);
    }

    #[test]
    fn test_analog_buffer_roundtrip() {
        let buf = AnalogBuffer::new();
        buf.store(15, 1234).unwrap();
        assert_eq!(buf.load(15).unwrap(), 1234);
        assert!(buf.load(16).is_err());
    }
}
