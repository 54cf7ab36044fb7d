// Timing, topics, robot geometry, hardware wiring and CLI settings
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

// Sampling tick frequency (analog scan, one channel group per tick)
pub const SAMPLER_HZ: u64 = 800;

// Control loop frequency
pub const LOOP_HZ: u64 = 50;

// Number of sampling ticks per control tick
pub const TIMER_DIVIDER: u64 = SAMPLER_HZ / LOOP_HZ;

// Control loop period in seconds, used to integrate joint and gait models
pub const CONTROL_LOOP_DT_S: f32 = 1.0 / LOOP_HZ as f32;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_VELOCITY: &str = "quadruped/cmd/velocity"; // gait velocity
pub const TOPIC_CMD_POSTURE: &str = "quadruped/cmd/posture"; // body posture
pub const TOPIC_CMD_FEET: &str = "quadruped/cmd/feet"; // single foot position
pub const TOPIC_CMD_JOINT: &str = "quadruped/cmd/joint"; // direct joint target
pub const TOPIC_CMD_SYSTEM: &str = "quadruped/cmd/system"; // enable / disable / calibrate
pub const TOPIC_CMD_ALL: &str = "quadruped/cmd/**"; // every command topic above
pub const TOPIC_STATE_JOINTS: &str = "quadruped/state/joints"; // joint telemetry
pub const TOPIC_HEALTH: &str = "quadruped/state/health"; // health status

// Publish joint telemetry every N control ticks
pub const STATE_PUBLISH_DIVIDER: u64 = 5;

// PWM generation: 50 Hz servo frame, 12-bit duty counter
pub const PWM_FREQUENCY_HZ: u32 = 50;
pub const PWM_MAX_VALUE: u16 = 4095;
pub const PWM_CHANNEL_COUNT: usize = 16;
pub const ANALOG_CHANNEL_COUNT: usize = 16;

/// Duty count for a pulse width in microseconds (20 ms frame, 4096 counts)
pub const fn pwm_from_pulse_us(pulse_us: u32) -> u16 {
    ((4096 * pulse_us) / (1_000_000 / PWM_FREQUENCY_HZ)) as u16
}

// Servo neutral pulse (1.5 ms)
pub const NEUTRAL_PWM: u16 = pwm_from_pulse_us(1500);

// Robot geometry (mm)
pub const HIP_POS_X_MM: f32 = 75.0;
pub const HIP_POS_Y_MM: f32 = 45.0;
pub const HIP_OFFSET_MM: f32 = 35.0;
pub const LEG_THIGH_LENGTH_MM: f32 = 60.0;
pub const LEG_CALF_LENGTH_MM: f32 = 60.0;
pub const DEFAULT_FEET_SPREAD_X_MM: f32 = HIP_POS_X_MM;
pub const DEFAULT_FEET_SPREAD_Y_MM: f32 = HIP_POS_Y_MM + HIP_OFFSET_MM;
pub const DEFAULT_BODY_HEIGHT_MM: f32 = 90.0;

/// Physical wiring and travel of one joint
#[derive(Debug, Clone, Copy)]
pub struct JointWiring {
    pub motor_channel: u8,
    pub analog_channel: u8,
    pub min_angle_deg: f32,
    pub max_angle_deg: f32,
    pub inverted: bool,
}

const fn wiring(motor: u8, analog: u8, min: f32, max: f32, inverted: bool) -> JointWiring {
    JointWiring {
        motor_channel: motor,
        analog_channel: analog,
        min_angle_deg: min,
        max_angle_deg: max,
        inverted,
    }
}

/// Wiring of one leg: [hip_roll, hip_pitch, knee_pitch], and whether Y is mirrored
#[derive(Debug, Clone, Copy)]
pub struct LegWiring {
    pub joints: [JointWiring; 3],
    pub y_inverted: bool,
}

// Leg order: front-left, front-right, back-left, back-right
pub const LEG_WIRING: [LegWiring; 4] = [
    LegWiring {
        joints: [
            wiring(7, 9, -45.0, 45.0, false),
            wiring(5, 11, -135.0, 45.0, true),
            wiring(6, 10, 0.0, 135.0, false),
        ],
        y_inverted: true,
    },
    LegWiring {
        joints: [
            wiring(4, 13, -45.0, 45.0, true),
            wiring(2, 15, -135.0, 45.0, false),
            wiring(3, 14, 0.0, 135.0, true),
        ],
        y_inverted: false,
    },
    LegWiring {
        joints: [
            wiring(10, 5, -45.0, 45.0, true),
            wiring(8, 7, -135.0, 45.0, true),
            wiring(9, 6, 0.0, 135.0, false),
        ],
        y_inverted: true,
    },
    LegWiring {
        joints: [
            wiring(13, 1, -45.0, 45.0, false),
            wiring(11, 3, -135.0, 45.0, false),
            wiring(12, 2, 0.0, 135.0, true),
        ],
        y_inverted: false,
    },
];

// Ears: [left, right]. Both share analog channel 0 on this board revision.
pub const EAR_WIRING: [JointWiring; 2] = [
    wiring(1, 0, -45.0, 45.0, false),
    wiring(0, 0, -45.0, 45.0, false),
];

/// Runtime settings
#[derive(Debug, Clone, Parser)]
#[command(name = "quadruped-runtime", about = "Quadruped locomotion control runtime")]
pub struct Settings {
    /// JSON file holding per-motor calibration records
    #[arg(long, default_value = "calibration.json")]
    pub store: PathBuf,

    /// Run the full body calibration sequence at start-up
    #[arg(long)]
    pub calibrate: bool,

    /// Default log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Run the control loop without opening a zenoh session
    #[arg(long)]
    pub no_zenoh: bool,

    /// Seed of the simulated servo board feedback noise
    #[arg(long, default_value_t = 0)]
    pub sim_seed: u64,
}
