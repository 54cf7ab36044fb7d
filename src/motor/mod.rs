// Motor layer of the locomotion core
//
// Provides:
// - Hardware seams (PWM sink, analog feedback source, calibration store, clock)
// - MotorController: ratio <-> PWM and feedback <-> ratio mapping
// - Unsupervised calibration state machine
// - Simulated servo board for bench runs and tests

pub mod calibration;
pub mod controller;
pub mod driver;
pub mod sim;
pub mod store;

pub use calibration::{CalibrationPhase, CalibrationRun};
pub use controller::{CalibrationState, MotorController, State};
pub use driver::{AnalogBuffer, AnalogDriver, Hardware, MotorDriver, PwmBuffer};
pub use sim::{ServoModel, SimBoard};
#[cfg(test)]
pub use sim::SimRig;
pub use store::{
    CalibrationData, CalibrationStore, JsonFileStore, MemoryStore, DEFAULT_CALIBRATION,
};
