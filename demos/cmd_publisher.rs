// Keyboard teleop: WASD move, Z/X rotate, R/F speed, E enable, SPACE disable, C calibrate, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use quadruped_runtime::config::{TOPIC_CMD_SYSTEM, TOPIC_CMD_VELOCITY};
use quadruped_runtime::messages::{SystemCommand, VelocityCommand};

const SPEEDS: [f32; 3] = [30.0, 60.0, 100.0]; // mm/s
const THETA_SPEEDS: [f32; 3] = [0.3, 0.6, 1.0]; // rad/s
const INPUT_TIMEOUT_MS: u64 = 100; // Reset velocities after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let velocity_pub = session.declare_publisher(TOPIC_CMD_VELOCITY).await?;
    let system_pub = session.declare_publisher(TOPIC_CMD_SYSTEM).await?;

    info!("Controls: WASD=move, Z/X=rotate, R/F=speed, E=enable, SPACE=disable, C=calibrate, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&velocity_pub, &system_pub).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    velocity_pub: &zenoh::pubsub::Publisher<'_>,
    system_pub: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;

    // Persistent velocity state
    let mut cmd = VelocityCommand::default();
    let mut last_movement_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let mut system = None;

                match code {
                    // Movement - update velocity and refresh timestamp
                    KeyCode::Char('w') if pressed => {
                        cmd.x_vel = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        cmd.x_vel = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        cmd.y_vel = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        cmd.y_vel = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    // Rotation
                    KeyCode::Char('z') if pressed => {
                        cmd.theta_vel = THETA_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('x') if pressed => {
                        cmd.theta_vel = -THETA_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    // Speed control
                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    // System
                    KeyCode::Char('e') if pressed => system = Some(SystemCommand::Enable),
                    KeyCode::Char(' ') if pressed => system = Some(SystemCommand::Disable),
                    KeyCode::Char('c') if pressed => system = Some(SystemCommand::Calibrate),

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }

                if let Some(system) = system {
                    info!("Sending {:?}", system);
                    system_pub.put(serde_json::to_string(&system)?).await?;
                }
            }
        }

        // Reset velocities if no movement input for INPUT_TIMEOUT_MS
        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            cmd = VelocityCommand::default();
        }

        // Always publish at ~50Hz, the runtime watchdog stops the gait otherwise
        velocity_pub.put(serde_json::to_string(&cmd)?).await?;
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
