// Fixed-rate control runtime with command watchdog
//
// An 800 Hz sampling tick drives the analog scan; every 16th sample is a 50 Hz
// control tick: watchdog -> gait planner -> body update -> PWM flush.
// Commands arrive as JSON over zenoh. If teleop stops sending velocity commands
// the watchdog zeroes the gait and the robot settles back to its stance.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{
    Settings, CMD_TIMEOUT, LOOP_HZ, SAMPLER_HZ, STATE_PUBLISH_DIVIDER, TIMER_DIVIDER,
    TOPIC_CMD_ALL, TOPIC_CMD_FEET, TOPIC_CMD_JOINT, TOPIC_CMD_POSTURE, TOPIC_CMD_SYSTEM,
    TOPIC_CMD_VELOCITY, TOPIC_HEALTH, TOPIC_STATE_JOINTS,
};
use crate::error::{Error, Result};
use crate::geometry::{Transform, Vec3};
use crate::locomotion::{Body, BodyCalibrationStatus, MovementPlanner};
use crate::messages::{
    FeetCommand, JointCommand, JointState, PostureCommand, RuntimeHealth, StateSnapshot,
    SystemCommand, VelocityCommand,
};
use crate::motor::{Hardware, JsonFileStore, SimBoard};

pub struct Runtime {
    hw: Hardware,
    body: Body,
    planner: MovementPlanner,
    latest_cmd: Option<VelocityCommand>,
    cmd_received_at: Duration,
    health: RuntimeHealth,
    sample_ticks: u64,
    control_ticks: u64,
    awaiting_calibration: bool,
}

impl Runtime {
    pub fn new(hw: Hardware) -> Result<Self> {
        let body = Body::new(&hw)?;
        let cmd_received_at = hw.clock.now();
        Ok(Self {
            hw,
            body,
            planner: MovementPlanner::new(),
            latest_cmd: None,
            cmd_received_at,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
            sample_ticks: 0,
            control_ticks: 0,
            awaiting_calibration: false,
        })
    }

    /// Bring the body up: either stand in the default posture or calibrate first
    pub fn start(&mut self, calibrate: bool) -> Result<()> {
        self.body.init()?;
        if calibrate {
            self.start_calibration()
        } else {
            self.stand()
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        info!("Releasing all motors");
        self.body.deinit()?;
        self.hw.motors.flush()
    }

    fn stand(&mut self) -> Result<()> {
        self.body.enable()?;
        let posture = *self.body.target_posture();
        self.body.set_posture(posture)
    }

    fn start_calibration(&mut self) -> Result<()> {
        self.body.start_calibration()?;
        self.awaiting_calibration = true;
        Ok(())
    }

    /// Dispatch one command payload by topic
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        match topic {
            TOPIC_CMD_VELOCITY => {
                let cmd = parse::<VelocityCommand>(payload)?;
                self.on_velocity(cmd);
            }
            TOPIC_CMD_POSTURE => {
                let cmd = parse::<PostureCommand>(payload)?;
                self.reject_while_calibrating("posture command")?;
                info!("Posture command: {:?}", cmd);
                self.body.set_posture(Transform::from(&cmd))?;
            }
            TOPIC_CMD_FEET => {
                let cmd = parse::<FeetCommand>(payload)?;
                self.reject_while_calibrating("feet command")?;
                debug!("Feet command: {:?}", cmd);
                self.body
                    .set_feet_position(cmd.leg, Vec3::new(cmd.x, cmd.y, cmd.z))?;
            }
            TOPIC_CMD_JOINT => {
                let cmd = parse::<JointCommand>(payload)?;
                self.reject_while_calibrating("joint command")?;
                debug!("Joint command: {:?}", cmd);
                let joint = self.body.joint_mut(cmd.channel)?;
                match cmd.time_s {
                    Some(time_s) => joint.set_target_timed(cmd.angle, time_s)?,
                    None => joint.set_target(cmd.angle)?,
                }
            }
            TOPIC_CMD_SYSTEM => {
                let cmd = parse::<SystemCommand>(payload)?;
                self.on_system(cmd)?;
            }
            other => {
                return Err(Error::NotFound(format!("no handler for topic {}", other)));
            }
        }
        Ok(())
    }

    fn on_velocity(&mut self, cmd: VelocityCommand) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = self.hw.clock.now();
    }

    fn on_system(&mut self, cmd: SystemCommand) -> Result<()> {
        info!("System command: {:?}", cmd);
        match cmd {
            SystemCommand::Enable => {
                self.reject_while_calibrating("enable")?;
                self.stand()
            }
            SystemCommand::Disable => self.body.disable(),
            SystemCommand::Calibrate => {
                self.reject_while_calibrating("calibration")?;
                self.body.disable()?;
                self.start_calibration()
            }
            SystemCommand::CalibrateJoint { channel } => {
                self.reject_while_calibrating("joint calibration")?;
                let joint = self.body.joint_mut(channel)?;
                joint.disable()?;
                joint.controller_mut().start_calibration()
            }
            SystemCommand::ClampVelocity { max } => self.body.clamp_velocity(max),
            SystemCommand::Gait { config } => self.planner.set_gait_config(config),
        }
    }

    /// The body calibration owns every joint until it is over
    fn reject_while_calibrating(&self, what: &str) -> Result<()> {
        if self.body.is_calibrating() {
            warn!("Rejecting {} during body calibration", what);
            return Err(Error::InvalidState(format!(
                "{} rejected while the body is calibrating",
                what
            )));
        }
        Ok(())
    }

    /// Feed the planner the latest velocity, or zero once it is stale
    fn apply_watchdog(&mut self) -> bool {
        let cmd_age = self.hw.clock.now().saturating_sub(self.cmd_received_at);

        match self.latest_cmd {
            Some(cmd) if cmd_age <= CMD_TIMEOUT => {
                self.planner
                    .set_velocity_command(cmd.x_vel, cmd.y_vel, cmd.theta_vel);
                false
            }
            _ => {
                // Watchdog triggered - stop the gait
                if self.health == RuntimeHealth::Ok {
                    warn!("Command stale ({:?} old), stopping gait", cmd_age);
                }
                self.planner.set_velocity_command(0.0, 0.0, 0.0);
                true
            }
        }
    }

    /// One sampling tick. Returns true when a control tick is due.
    pub fn sample_tick(&mut self) -> bool {
        if let Err(e) = self.hw.analog.scan_step() {
            warn!("Analog scan failed: {}", e);
        }
        self.sample_ticks += 1;
        self.sample_ticks % TIMER_DIVIDER == 0
    }

    /// One control tick. A failure is reported after the whole tick ran.
    pub fn control_tick(&mut self) -> Result<()> {
        self.control_ticks += 1;
        let stale = self.apply_watchdog();

        // 1. Gait targets, unless a calibration owns the legs
        let planned = if self.body.is_calibrating() {
            Ok(())
        } else {
            self.planner.update(&mut self.body)
        };

        // 2. Joint models, feedback and PWM
        let updated = self.body.update();
        let flushed = self.hw.motors.flush();

        // 3. Stand up once a start-up calibration is over
        let recovered = self.finish_calibration();

        let result = planned.and(updated).and(flushed).and(recovered);
        self.health = if result.is_err() {
            RuntimeHealth::Fault
        } else if self.body.is_calibrating() {
            RuntimeHealth::Calibrating
        } else if stale {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        };
        result
    }

    fn finish_calibration(&mut self) -> Result<()> {
        if !self.awaiting_calibration || self.body.is_calibrating() {
            return Ok(());
        }
        self.awaiting_calibration = false;
        match self.body.calibration_status() {
            BodyCalibrationStatus::Completed => {
                info!("Calibration done, standing up");
                self.stand()
            }
            status => {
                error!("Calibration did not complete: {:?}", status);
                Ok(())
            }
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn control_ticks(&self) -> u64 {
        self.control_ticks
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn planner(&self) -> &MovementPlanner {
        &self.planner
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let joints = self
            .body
            .joint_table()
            .iter()
            .filter_map(|(channel, id)| {
                let joint = self.body.joint(channel).ok()?;
                let controller = joint.controller();
                Some(JointState {
                    channel,
                    joint: id,
                    enabled: joint.is_enabled(),
                    target: joint.target(),
                    position: joint.position(),
                    feedback: joint.feedback(),
                    prediction: joint.prediction(),
                    calibration: controller.calibration_state(),
                    calibration_progress: controller.calibration_progress(),
                })
            })
            .collect();
        StateSnapshot {
            joints,
            gait_phase: self.planner.gait_phase(),
            moving: self.planner.is_moving(),
            calibration: self.body.calibration_status().clone(),
        }
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

fn sampler() -> Interval {
    let mut tick = interval(Duration::from_micros(1_000_000 / SAMPLER_HZ));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

/// Runtime on the simulated servo board, calibration records in the JSON store
fn build_runtime(settings: &Settings) -> Result<Runtime> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = Arc::new(JsonFileStore::open(&settings.store)?);
    info!("Using simulated servo board (seed {})", settings.sim_seed);
    let board = Arc::new(SimBoard::with_robot_wiring(clock, settings.sim_seed));
    let mut runtime = Runtime::new(board.hardware(store))?;
    runtime.start(settings.calibrate)?;
    Ok(runtime)
}

pub async fn run(settings: Settings) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut runtime = build_runtime(&settings)?;
    info!(
        "Runtime started: {}Hz sampling, {}Hz control, {}ms watchdog timeout",
        SAMPLER_HZ,
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );

    if settings.no_zenoh {
        run_local(&mut runtime).await;
    } else {
        run_zenoh(&mut runtime).await?;
    }

    runtime.shutdown()?;
    Ok(())
}

/// Control loop only, no commands in or telemetry out
async fn run_local(runtime: &mut Runtime) {
    info!("Zenoh disabled, running the control loop alone");
    let mut tick = sampler();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                return;
            }
            _ = tick.tick() => {}
        }
        if !runtime.sample_tick() {
            continue;
        }
        if let Err(e) = runtime.control_tick() {
            warn!("Control tick failed: {}", e);
        }
    }
}

async fn run_zenoh(
    runtime: &mut Runtime,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_ALL).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE_JOINTS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    info!("Subscribed to: {}", TOPIC_CMD_ALL);
    info!("Publishing to: {}, {}", TOPIC_STATE_JOINTS, TOPIC_HEALTH);

    let mut tick = sampler();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                return Ok(());
            }
            _ = tick.tick() => {}
        }
        if !runtime.sample_tick() {
            continue;
        }

        // 1. Drain all pending commands (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let topic = sample.key_expr().as_str().to_string();
            let payload = sample.payload().to_bytes();
            if let Err(e) = runtime.on_message(&topic, &payload) {
                warn!("Command on {} rejected: {}", topic, e);
            }
        }

        // 2. Control tick (includes watchdog logic)
        if let Err(e) = runtime.control_tick() {
            warn!("Control tick failed: {}", e);
        }

        // 3. Publish health, and joint state every few ticks
        let health_json = serde_json::to_string(&runtime.health())?;
        pub_health.put(health_json).await?;
        if runtime.control_ticks() % STATE_PUBLISH_DIVIDER == 0 {
            let state_json = serde_json::to_string(&runtime.snapshot())?;
            pub_state.put(state_json).await?;
        }
    }
}
