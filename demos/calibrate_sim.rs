// Bench run of the motor calibration against a simulated servo
//
// The servo model is configurable so the calibration can be checked against
// known deadband, latency, noise and travel. Runs on virtual time, finishes instantly.
//
// Usage: cargo run --example calibrate_sim -- --motor 7 --deadband 4 --latency-ms 60

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use quadruped_runtime::clock::{Clock, SimClock};
use quadruped_runtime::config::{EAR_WIRING, LEG_WIRING};
use quadruped_runtime::motor::{
    CalibrationStore, JsonFileStore, MemoryStore, MotorController, ServoModel, SimBoard,
};

#[derive(Debug, Parser)]
#[command(name = "calibrate_sim", about = "Calibrate one simulated servo")]
struct Args {
    /// Motor channel, as wired on the robot
    #[arg(long, default_value_t = 7)]
    motor: u8,

    /// Servo deadband, in PWM units
    #[arg(long, default_value_t = 2.0)]
    deadband: f32,

    /// Transport latency of the servo
    #[arg(long, default_value_t = 30)]
    latency_ms: u64,

    /// Feedback noise amplitude, in mV
    #[arg(long, default_value_t = 3)]
    noise_mv: i32,

    /// Mechanical stops, in PWM units
    #[arg(long, default_value_t = 130.0)]
    travel_min: f32,
    #[arg(long, default_value_t = 480.0)]
    travel_max: f32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Persist the result to this JSON store instead of memory
    #[arg(long)]
    store: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let wiring = LEG_WIRING
        .iter()
        .flat_map(|leg| leg.joints.iter())
        .chain(EAR_WIRING.iter())
        .find(|joint| joint.motor_channel == args.motor)
        .ok_or_else(|| format!("motor {} is not wired", args.motor))?;

    let clock = Arc::new(SimClock::new());
    let board = Arc::new(SimBoard::with_robot_wiring(clock.clone(), args.seed));
    let model = ServoModel {
        travel_min: args.travel_min,
        travel_max: args.travel_max,
        deadband: args.deadband,
        latency: Duration::from_millis(args.latency_ms),
        noise_mv: args.noise_mv,
        ..ServoModel::default()
    };
    board.set_model(args.motor, model);

    let store: Arc<dyn CalibrationStore> = match &args.store {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let hw = board.hardware(store);

    let mut motor = MotorController::new(wiring.motor_channel, wiring.analog_channel, hw);
    motor.init()?;
    motor.disable()?;

    info!("Servo model: {:?}", model);
    motor.start_calibration()?;
    while motor.is_calibrating() {
        info!("Progress: {:>3.0}%", motor.calibration_progress() * 100.0);
        std::thread::sleep(Duration::from_millis(50));
    }
    let outcome = motor.wait_calibration();

    println!();
    match outcome {
        Ok(()) => {
            let data = motor.calibration_data();
            println!(
                "Calibration of motor {} completed in {:.1} s of servo time",
                args.motor,
                clock.now().as_secs_f32()
            );
            println!(
                "  pwm range:      {} .. {}  (stops at {:.0} .. {:.0})",
                data.min_pwm, data.max_pwm, model.travel_min, model.travel_max
            );
            println!("  voltage range:  {} .. {} mV", data.min_voltage, data.max_voltage);
            println!(
                "  feedback noise: {} mV  (model {} mV)",
                data.feedback_noise, model.noise_mv
            );
            println!("  pwm deadband:   {}  (model {:.1})", data.pwm_deadband, model.deadband);
            println!(
                "  latency:        {} ms  (model {} ms)",
                data.feedback_latency_ms, args.latency_ms
            );
            Ok(())
        }
        Err(e) => {
            match motor.last_calibration_failure() {
                Some((phase, _)) => println!("Calibration failed during {:?}: {}", phase, e),
                None => println!("Calibration failed: {}", e),
            }
            Err(e.into())
        }
    }
}
