// Motor diagnostic: READ-ONLY check of calibration records and live joint feedback
//
// This tool does NOT command any motor. It inspects the calibration store and,
// if a runtime is running, listens to its joint telemetry.
//
// Usage: cargo run --example motor_diagnostic -- [calibration.json]

use std::time::Duration;

use quadruped_runtime::config::{EAR_WIRING, LEG_WIRING, TOPIC_HEALTH, TOPIC_STATE_JOINTS};
use quadruped_runtime::motor::store::load_calibration;
use quadruped_runtime::motor::{JsonFileStore, DEFAULT_CALIBRATION};
use quadruped_runtime::Error;

const LEG_NAMES: [&str; 4] = ["Front-left", "Front-right", "Back-left", "Back-right"];
const JOINT_NAMES: [&str; 3] = ["hip roll", "hip pitch", "knee pitch"];
const EAR_NAMES: [&str; 2] = ["Left ear", "Right ear"];
const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "calibration.json".to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Quadruped Motor Diagnostic (READ-ONLY)               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  This tool only READS calibration and telemetry, no movement ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Calibration store: {}", path);
    println!();

    println!("Step 1: Opening calibration store...");
    let store = match JsonFileStore::open(&path) {
        Ok(store) => {
            println!("  ✓ Store opened");
            store
        }
        Err(e) => {
            println!("  ✗ Failed to open store: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the file path is correct");
            println!("  - A corrupted file can be removed, motors fall back to defaults");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Reading calibration records...");
    let joints = LEG_WIRING
        .iter()
        .zip(LEG_NAMES)
        .flat_map(|(leg, leg_name)| {
            leg.joints
                .iter()
                .zip(JOINT_NAMES)
                .map(move |(wiring, joint_name)| (format!("{} {}", leg_name, joint_name), wiring))
        })
        .chain(
            EAR_WIRING
                .iter()
                .zip(EAR_NAMES)
                .map(|(wiring, name)| (name.to_string(), wiring)),
        );

    let mut missing = 0;
    for (name, wiring) in joints {
        print!("  {:<24} (motor {:>2}): ", name, wiring.motor_channel);
        match load_calibration(&store, wiring.motor_channel) {
            Ok(data) if data.is_consistent() => println!(
                "✓ pwm {}..{}  mV {}..{}  noise {} mV  deadband {}  latency {} ms",
                data.min_pwm,
                data.max_pwm,
                data.min_voltage,
                data.max_voltage,
                data.feedback_noise,
                data.pwm_deadband,
                data.feedback_latency_ms
            ),
            Ok(_) => {
                println!("✗ INCONSISTENT record, defaults will be used");
                missing += 1;
            }
            Err(Error::NotFound(_)) => {
                println!("- not calibrated");
                missing += 1;
            }
            Err(e) => {
                println!("✗ ERROR: {}", e);
                missing += 1;
            }
        }
    }
    println!();
    if missing > 0 {
        println!("⚠ {} motor(s) will run on the default calibration:", missing);
        println!(
            "  pwm {}..{}  mV {}..{}",
            DEFAULT_CALIBRATION.min_pwm,
            DEFAULT_CALIBRATION.max_pwm,
            DEFAULT_CALIBRATION.min_voltage,
            DEFAULT_CALIBRATION.max_voltage
        );
        println!("  Run the runtime with --calibrate, or calibrate_sim on the bench");
        println!();
    }

    println!("Step 3: Listening for runtime telemetry...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let state_sub = session.declare_subscriber(TOPIC_STATE_JOINTS).await?;
    let health_sub = session.declare_subscriber(TOPIC_HEALTH).await?;

    match tokio::time::timeout(TELEMETRY_TIMEOUT, health_sub.recv_async()).await {
        Ok(Ok(sample)) => {
            let health = String::from_utf8_lossy(&sample.payload().to_bytes()).to_string();
            println!("  ✓ Runtime health: {}", health);
        }
        _ => {
            println!("  ✗ No runtime found on {}", TOPIC_HEALTH);
            println!();
            println!("Diagnostic complete (offline).");
            return Ok(());
        }
    }

    let sample = match tokio::time::timeout(TELEMETRY_TIMEOUT, state_sub.recv_async()).await {
        Ok(Ok(sample)) => sample,
        _ => {
            println!("  ✗ No joint telemetry on {}", TOPIC_STATE_JOINTS);
            return Ok(());
        }
    };
    let snapshot: serde_json::Value = serde_json::from_slice(&sample.payload().to_bytes())?;
    println!();
    println!(
        "  {:>7}  {:>8}  {:>9}  {:>9}  {:>9}  {:<14}",
        "channel", "enabled", "target", "position", "feedback", "calibration"
    );
    for joint in snapshot["joints"].as_array().into_iter().flatten() {
        println!(
            "  {:>7}  {:>8}  {:>9.3}  {:>9.3}  {:>9.3}  {:<14}",
            joint["channel"],
            joint["enabled"],
            joint["target"].as_f64().unwrap_or(f64::NAN),
            joint["position"].as_f64().unwrap_or(f64::NAN),
            joint["feedback"].as_f64().unwrap_or(f64::NAN),
            joint["calibration"].as_str().unwrap_or("?"),
        );
    }
    println!();
    println!("  Body calibration: {}", snapshot["calibration"]);
    println!("  Gait phase: {}  moving: {}", snapshot["gait_phase"], snapshot["moving"]);
    println!();
    println!("Diagnostic complete.");

    Ok(())
}
