// Simulated servo board
//
// Stands in for the PWM generator and the feedback ADC when no hardware is
// attached. Each servo follows its PWM command after a transport latency, at a
// bounded speed, within mechanical stops, and ignores corrections smaller than
// its deadband. Physics is integrated lazily from the shared clock, so a
// `SimClock` makes whole calibration runs deterministic and instant.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
#[cfg(test)]
use crate::clock::SimClock;
use crate::config::{
    pwm_from_pulse_us, ANALOG_CHANNEL_COUNT, EAR_WIRING, LEG_WIRING, NEUTRAL_PWM,
    PWM_CHANNEL_COUNT,
};
use crate::error::{Error, Result};

use super::driver::{AnalogDriver, Hardware, MotorDriver, PwmBuffer};
use super::store::CalibrationStore;
#[cfg(test)]
use super::store::MemoryStore;

// Potentiometer: 200 mV at a 0.5 ms pulse, 3000 mV at 2.5 ms
const POT_MIN_MV: f32 = 200.0;
const POT_MAX_MV: f32 = 3000.0;

#[derive(Debug, Clone, Copy)]
pub struct ServoModel {
    /// Mechanical stops, in PWM units
    pub travel_min: f32,
    pub travel_max: f32,
    /// Smallest correction the servo reacts to, in PWM units
    pub deadband: f32,
    pub latency: Duration,
    /// PWM units per second
    pub speed: f32,
    /// Uniform feedback noise amplitude, in mV
    pub noise_mv: i32,
    pub stuck: bool,
}

impl Default for ServoModel {
    fn default() -> Self {
        Self {
            travel_min: 130.0,
            travel_max: 480.0,
            deadband: 2.0,
            latency: Duration::from_millis(30),
            speed: 1000.0,
            noise_mv: 3,
            stuck: false,
        }
    }
}

#[derive(Debug)]
struct SimServo {
    analog_channel: u8,
    model: ServoModel,
    position: f32,
    moving: bool,
    time: Duration,
    active: u16,
    pending: VecDeque<(Duration, u16)>,
    reads: u32,
    writes: u32,
    fail_reads_after: Option<u32>,
    fail_write_at: Option<u32>,
}

impl SimServo {
    fn new(analog_channel: u8, now: Duration) -> Self {
        Self {
            analog_channel,
            model: ServoModel::default(),
            position: NEUTRAL_PWM as f32,
            moving: false,
            time: now,
            active: 0,
            pending: VecDeque::new(),
            reads: 0,
            writes: 0,
            fail_reads_after: None,
            fail_write_at: None,
        }
    }

    fn command(&mut self, now: Duration, value: u16) {
        self.advance(now);
        self.pending.push_back((now + self.model.latency, value));
    }

    /// Integrate motion up to `now`, switching commands as they take effect
    fn advance(&mut self, now: Duration) {
        loop {
            while let Some(&(at, value)) = self.pending.front() {
                if at > self.time {
                    break;
                }
                self.active = value;
                self.pending.pop_front();
            }
            if self.time >= now {
                break;
            }
            let until = match self.pending.front() {
                Some(&(at, _)) if at < now => at,
                _ => now,
            };
            self.move_for((until - self.time).as_secs_f32());
            self.time = until;
        }
    }

    fn move_for(&mut self, dt: f32) {
        // no pulse: the servo is free and stays where it is
        if self.active == 0 || self.model.stuck {
            return;
        }
        let target = (self.active as f32).clamp(self.model.travel_min, self.model.travel_max);
        let error = target - self.position;
        if !self.moving && error.abs() <= self.model.deadband {
            return;
        }
        self.moving = true;
        let step = self.model.speed * dt;
        if step >= error.abs() {
            self.position = target;
            self.moving = false;
        } else {
            self.position += step * error.signum();
        }
    }

    fn voltage(&self) -> f32 {
        let min_pwm = pwm_from_pulse_us(500) as f32;
        let max_pwm = pwm_from_pulse_us(2500) as f32;
        POT_MIN_MV + (self.position - min_pwm) * (POT_MAX_MV - POT_MIN_MV) / (max_pwm - min_pwm)
    }
}

struct SimState {
    servos: [Option<SimServo>; PWM_CHANNEL_COUNT],
    // analog channel -> motor channel
    analog_map: [Option<u8>; ANALOG_CHANNEL_COUNT],
    rng: StdRng,
}

pub struct SimBoard {
    clock: Arc<dyn Clock>,
    pwm: PwmBuffer,
    state: Mutex<SimState>,
}

impl SimBoard {
    /// Empty board, no servo attached
    pub fn new(clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self {
            clock,
            pwm: PwmBuffer::new(),
            state: Mutex::new(SimState {
                servos: std::array::from_fn(|_| None),
                analog_map: [None; ANALOG_CHANNEL_COUNT],
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    /// Board with a servo on every joint of the robot wiring
    pub fn with_robot_wiring(clock: Arc<dyn Clock>, seed: u64) -> Self {
        let board = Self::new(clock, seed);
        let joints = LEG_WIRING
            .iter()
            .flat_map(|leg| leg.joints.iter())
            .chain(EAR_WIRING.iter());
        for joint in joints {
            board.attach(joint.motor_channel, joint.analog_channel);
        }
        board
    }

    /// Mechanical travel of a default servo, in PWM units
    pub fn default_travel() -> (f32, f32) {
        let model = ServoModel::default();
        (model.travel_min, model.travel_max)
    }

    pub fn attach(&self, motor_channel: u8, analog_channel: u8) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(slot) = state.servos.get_mut(motor_channel as usize) {
            *slot = Some(SimServo::new(analog_channel, now));
        }
        if let Some(slot) = state.analog_map.get_mut(analog_channel as usize) {
            *slot = Some(motor_channel);
        }
    }

    pub fn hardware(self: &Arc<Self>, store: Arc<dyn CalibrationStore>) -> Hardware {
        Hardware {
            motors: self.clone(),
            analog: self.clone(),
            store,
            clock: self.clock.clone(),
        }
    }

    fn with_servo<T>(&self, motor_channel: u8, f: impl FnOnce(&mut SimServo) -> T) -> Option<T> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let servo = state.servos.get_mut(motor_channel as usize)?.as_mut()?;
        servo.advance(now);
        Some(f(servo))
    }

    /// Current servo position, in PWM units
    pub fn position(&self, motor_channel: u8) -> Option<f32> {
        self.with_servo(motor_channel, |servo| servo.position)
    }

    /// Move a servo by hand
    pub fn set_position(&self, motor_channel: u8, position: f32) {
        self.with_servo(motor_channel, |servo| {
            servo.position = position;
            servo.moving = false;
        });
    }

    pub fn set_model(&self, motor_channel: u8, model: ServoModel) {
        self.with_servo(motor_channel, |servo| servo.model = model);
    }

    pub fn set_noise(&self, motor_channel: u8, noise_mv: i32) {
        self.with_servo(motor_channel, |servo| servo.model.noise_mv = noise_mv);
    }

    pub fn set_deadband(&self, motor_channel: u8, deadband: f32) {
        self.with_servo(motor_channel, |servo| servo.model.deadband = deadband);
    }

    pub fn set_latency(&self, motor_channel: u8, latency: Duration) {
        self.with_servo(motor_channel, |servo| servo.model.latency = latency);
    }

    pub fn set_stuck(&self, motor_channel: u8, stuck: bool) {
        self.with_servo(motor_channel, |servo| servo.model.stuck = stuck);
    }

    /// Every feedback read after the next `reads` fails
    pub fn fail_analog_after(&self, motor_channel: u8, reads: u32) {
        self.with_servo(motor_channel, |servo| {
            servo.fail_reads_after = Some(servo.reads + reads);
        });
    }

    /// The `nth` PWM write from now fails, once
    pub fn fail_pwm_write_at(&self, motor_channel: u8, nth: u32) {
        self.with_servo(motor_channel, |servo| {
            servo.fail_write_at = Some(servo.writes + nth);
        });
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        for servo in state.servos.iter_mut().flatten() {
            servo.fail_reads_after = None;
            servo.fail_write_at = None;
        }
    }
}

impl MotorDriver for SimBoard {
    fn set_pwm(&self, channel: u8, value: u16) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(servo) = state.servos.get_mut(channel as usize).and_then(Option::as_mut) {
            servo.writes += 1;
            if servo.fail_write_at == Some(servo.writes) {
                servo.fail_write_at = None;
                return Err(Error::HardwareFailure(format!(
                    "simulated PWM write failure on channel {}",
                    channel
                )));
            }
            self.pwm.set(channel, value)?;
            servo.command(now, value);
            return Ok(());
        }
        self.pwm.set(channel, value)
    }

    fn pwm(&self, channel: u8) -> Result<u16> {
        self.pwm.get(channel)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl AnalogDriver for SimBoard {
    fn voltage(&self, channel: u8) -> Result<i32> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let SimState {
            servos,
            analog_map,
            rng,
        } = &mut *state;

        let motor = *analog_map.get(channel as usize).ok_or_else(|| {
            Error::InvalidParameters(format!("Analog channel {} out of range", channel))
        })?;
        let servo = match motor {
            Some(m) => servos[m as usize].as_mut(),
            None => None,
        };
        // floating input
        let Some(servo) = servo else {
            return Ok(0);
        };
        debug_assert_eq!(servo.analog_channel, channel);

        servo.reads += 1;
        if servo.fail_reads_after.is_some_and(|limit| servo.reads > limit) {
            return Err(Error::HardwareFailure(format!(
                "simulated ADC failure on channel {}",
                channel
            )));
        }

        servo.advance(now);
        let noise = match servo.model.noise_mv {
            n if n > 0 => rng.random_range(-n..=n),
            _ => 0,
        };
        Ok(servo.voltage() as i32 + noise)
    }
}

/// Simulated board, virtual clock and volatile store wired together
#[cfg(test)]
pub struct SimRig {
    pub clock: Arc<SimClock>,
    pub board: Arc<SimBoard>,
    pub store: Arc<MemoryStore>,
    pub hw: Hardware,
}

#[cfg(test)]
impl SimRig {
    pub fn new(seed: u64) -> Self {
        let clock = Arc::new(SimClock::new());
        let board = Arc::new(SimBoard::with_robot_wiring(clock.clone(), seed));
        let store = Arc::new(MemoryStore::new());
        let hw = board.hardware(store.clone());
        Self {
            clock,
            board,
            store,
            hw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> SimRig {
        let rig = SimRig::new(1);
        rig.board.set_noise(7, 0);
        rig
    }

    #[test]
    fn test_servo_starts_at_neutral_and_free() {
        let rig = rig();
        rig.clock.advance(Duration::from_secs(1));
        assert_eq!(rig.board.position(7), Some(NEUTRAL_PWM as f32));
        assert_eq!(rig.hw.analog.voltage(9).unwrap(), 1600);
    }

    #[test]
    fn test_command_applies_after_latency() {
        let rig = rig();
        rig.hw.motors.set_pwm(7, 400).unwrap();
        rig.clock.advance(Duration::from_millis(29));
        assert_eq!(rig.board.position(7), Some(307.0));
        rig.clock.advance(Duration::from_millis(51));
        let pos = rig.board.position(7).unwrap();
        assert!((pos - 357.0).abs() < 0.5, "position {}", pos);
        rig.clock.advance(Duration::from_millis(100));
        assert_eq!(rig.board.position(7), Some(400.0));
    }

    #[test]
    fn test_travel_is_limited_by_stops() {
        let rig = rig();
        rig.hw.motors.set_pwm(7, 600).unwrap();
        rig.clock.advance(Duration::from_secs(1));
        assert_eq!(rig.board.position(7), Some(480.0));
        rig.hw.motors.set_pwm(7, 20).unwrap();
        rig.clock.advance(Duration::from_secs(1));
        assert_eq!(rig.board.position(7), Some(130.0));
    }

    #[test]
    fn test_small_corrections_are_ignored() {
        let rig = rig();
        rig.hw.motors.set_pwm(7, 309).unwrap();
        rig.clock.advance(Duration::from_millis(200));
        assert_eq!(rig.board.position(7), Some(307.0));
        rig.hw.motors.set_pwm(7, 310).unwrap();
        rig.clock.advance(Duration::from_millis(200));
        assert_eq!(rig.board.position(7), Some(310.0));
    }

    #[test]
    fn test_zero_pwm_releases_servo() {
        let rig = rig();
        rig.hw.motors.set_pwm(7, 400).unwrap();
        rig.clock.advance(Duration::from_millis(60));
        rig.hw.motors.set_pwm(7, 0).unwrap();
        rig.clock.advance(Duration::from_secs(1));
        let pos = rig.board.position(7).unwrap();
        assert!(pos > 307.0 && pos < 400.0, "position {}", pos);
    }

    #[test]
    fn test_fault_injection() {
        let rig = rig();
        rig.board.fail_analog_after(7, 2);
        assert!(rig.hw.analog.voltage(9).is_ok());
        assert!(rig.hw.analog.voltage(9).is_ok());
        assert!(matches!(rig.hw.analog.voltage(9), Err(Error::HardwareFailure(_))));

        rig.board.fail_pwm_write_at(7, 2);
        assert!(rig.hw.motors.set_pwm(7, 300).is_ok());
        assert!(rig.hw.motors.set_pwm(7, 301).is_err());
        assert!(rig.hw.motors.set_pwm(7, 302).is_ok());
        assert_eq!(rig.hw.motors.pwm(7).unwrap(), 302);

        rig.board.clear_faults();
        assert!(rig.hw.analog.voltage(9).is_ok());
    }

    #[test]
    fn test_unwired_analog_channel_reads_zero() {
        let rig = rig();
        assert_eq!(rig.hw.analog.voltage(4).unwrap(), 0);
        assert!(rig.hw.analog.voltage(16).is_err());
    }
}
