// Shared error taxonomy for the locomotion core
//
// Every layer (estimation, motor, joint, leg, body, planner) returns this type so
// failures propagate unchanged up the control tick.

/// Error types for the locomotion core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error")]
    Unknown,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Out of memory")]
    NoMemory,

    #[error("Hardware failure: {0}")]
    HardwareFailure(String),

    #[error("Software failure: {0}")]
    SoftwareFailure(String),

    #[error("Target unreachable: distance {distance_mm:.2} mm outside reach {reach_mm:.2} mm")]
    Unreachable { distance_mm: f32, reach_mm: f32 },

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::HardwareFailure(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SoftwareFailure(e.to_string())
    }
}
