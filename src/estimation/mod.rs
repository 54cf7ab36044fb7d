// State estimation helpers used by joints (Kalman fusion) and motor calibration
// (baseline regression for stall detection).

pub mod kalman;
pub mod regression;

pub use kalman::KalmanFilter1D;
pub use regression::{FastRegression, LineFit};
