// Body: four legs and two ears
//
// Foot targets are held in the world frame and the body posture is a transform
// of the body frame in that world. Every change re-solves all four legs and
// times them to arrive together.
//
// Provides:
// - Posture and per-foot targets with synchronized arrival
// - JointTable: motor channel -> joint lookup for the command layer
// - Whole-body calibration, sequenced leg by leg from the control tick

use std::f32::consts::{FRAC_PI_2, FRAC_PI_6};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{
    DEFAULT_BODY_HEIGHT_MM, DEFAULT_FEET_SPREAD_X_MM, DEFAULT_FEET_SPREAD_Y_MM, EAR_WIRING,
    HIP_POS_X_MM, HIP_POS_Y_MM, LEG_WIRING, PWM_CHANNEL_COUNT,
};
use crate::error::{Error, Result};
use crate::geometry::{Quat, Transform, Vec3};
use crate::motor::{CalibrationState, Hardware};

use super::joint::Joint;
use super::kinematics::LegAngles;
use super::leg::{Leg, LegJoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegIndex {
    FrontLeft,
    FrontRight,
    BackLeft,
    BackRight,
}

impl LegIndex {
    pub const ALL: [LegIndex; 4] = [
        LegIndex::FrontLeft,
        LegIndex::FrontRight,
        LegIndex::BackLeft,
        LegIndex::BackRight,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn is_front(self) -> bool {
        matches!(self, LegIndex::FrontLeft | LegIndex::FrontRight)
    }

    pub fn is_left(self) -> bool {
        matches!(self, LegIndex::FrontLeft | LegIndex::BackLeft)
    }

    /// Hip position in the body frame, mm
    pub fn hip_position(self) -> Vec3 {
        Vec3::new(
            self.x_sign() * HIP_POS_X_MM,
            self.y_sign() * HIP_POS_Y_MM,
            0.0,
        )
    }

    /// Neutral stance foot position in the world frame, mm
    pub fn default_foot_position(self) -> Vec3 {
        Vec3::new(
            self.x_sign() * DEFAULT_FEET_SPREAD_X_MM,
            self.y_sign() * DEFAULT_FEET_SPREAD_Y_MM,
            0.0,
        )
    }

    fn x_sign(self) -> f32 {
        if self.is_front() { 1.0 } else { -1.0 }
    }

    fn y_sign(self) -> f32 {
        if self.is_left() { 1.0 } else { -1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EarIndex {
    Left,
    Right,
}

impl EarIndex {
    pub const ALL: [EarIndex; 2] = [EarIndex::Left, EarIndex::Right];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Where a motor channel sits on the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JointId {
    Leg { leg: LegIndex, joint: LegJoint },
    Ear { ear: EarIndex },
}

/// Motor channel -> joint
#[derive(Debug, Clone)]
pub struct JointTable {
    slots: [Option<JointId>; PWM_CHANNEL_COUNT],
}

impl JointTable {
    pub fn new() -> Self {
        Self {
            slots: [None; PWM_CHANNEL_COUNT],
        }
    }

    pub fn register(&mut self, channel: u8, id: JointId) -> Result<()> {
        let slot = self.slots.get_mut(channel as usize).ok_or_else(|| {
            Error::InvalidParameters(format!("motor channel {} out of range", channel))
        })?;
        if let Some(existing) = slot {
            return Err(Error::InvalidState(format!(
                "motor channel {} already used by {:?}",
                channel, existing
            )));
        }
        *slot = Some(id);
        Ok(())
    }

    pub fn lookup(&self, channel: u8) -> Result<JointId> {
        self.slots
            .get(channel as usize)
            .copied()
            .flatten()
            .ok_or_else(|| Error::NotFound(format!("no joint on motor channel {}", channel)))
    }

    /// Registered (channel, joint) pairs in channel order
    pub fn iter(&self) -> impl Iterator<Item = (u8, JointId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(channel, id)| id.map(|id| (channel as u8, id)))
    }
}

impl Default for JointTable {
    fn default() -> Self {
        Self::new()
    }
}

// Calibration poses: hip pitch points front legs forward and back legs backward
const SAFE_HIP_ROLL: f32 = 0.0;
const SAFE_HIP_PITCH: f32 = FRAC_PI_6;
const RETRACT_KNEE: f32 = FRAC_PI_2;
const CALIBRATION_SETTLE: Duration = Duration::from_millis(500);

fn safe_hip_pitch(leg: LegIndex) -> f32 {
    if leg.is_front() {
        SAFE_HIP_PITCH
    } else {
        -SAFE_HIP_PITCH
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BodyCalibrationStatus {
    Idle,
    Running {
        leg: LegIndex,
        joint: Option<LegJoint>,
    },
    Completed,
    Failed {
        leg: LegIndex,
        joint: Option<LegJoint>,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
enum CalibrationStep {
    /// Release every joint before touching the next leg
    Prepare,
    Start(LegJoint),
    Await(LegJoint),
    /// Calibrated joint is moving to its safe angle
    Settle { next: LegJoint, until: Duration },
    /// Whole leg is folding away
    Retract { until: Duration },
}

impl CalibrationStep {
    fn joint(self) -> Option<LegJoint> {
        match self {
            CalibrationStep::Start(joint) | CalibrationStep::Await(joint) => Some(joint),
            CalibrationStep::Settle { next, .. } => Some(next),
            CalibrationStep::Prepare | CalibrationStep::Retract { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CalibrationSequence {
    leg: LegIndex,
    step: CalibrationStep,
}

pub struct Body {
    legs: [Leg; 4],
    ears: [Joint; 2],
    joint_table: JointTable,
    feet_positions: [Vec3; 4],
    posture: Transform,
    clock: Arc<dyn Clock>,
    calibration: Option<CalibrationSequence>,
    calibration_status: BodyCalibrationStatus,
}

impl Body {
    /// Build the robot from the wiring table. Nothing touches the hardware until `init`.
    pub fn new(hw: &Hardware) -> Result<Self> {
        let legs = LEG_WIRING.map(|wiring| Leg::from_wiring(&wiring, hw));
        let ears = EAR_WIRING.map(|wiring| Joint::from_wiring(&wiring, hw.clone()));

        let mut joint_table = JointTable::new();
        for (leg, wiring) in LegIndex::ALL.iter().zip(LEG_WIRING.iter()) {
            for (joint, joint_wiring) in LegJoint::ALL.iter().zip(wiring.joints.iter()) {
                joint_table.register(
                    joint_wiring.motor_channel,
                    JointId::Leg {
                        leg: *leg,
                        joint: *joint,
                    },
                )?;
            }
        }
        for (ear, wiring) in EarIndex::ALL.iter().zip(EAR_WIRING.iter()) {
            joint_table.register(wiring.motor_channel, JointId::Ear { ear: *ear })?;
        }

        Ok(Self {
            legs,
            ears,
            joint_table,
            feet_positions: LegIndex::ALL.map(LegIndex::default_foot_position),
            posture: Transform::new(Vec3::new(0.0, 0.0, DEFAULT_BODY_HEIGHT_MM), Quat::identity()),
            clock: hw.clock.clone(),
            calibration: None,
            calibration_status: BodyCalibrationStatus::Idle,
        })
    }

    pub fn init(&mut self) -> Result<()> {
        self.legs.iter_mut().try_for_each(Leg::init)?;
        self.ears.iter_mut().try_for_each(Joint::init)
    }

    /// Wait for running calibrations, then release every motor
    pub fn deinit(&mut self) -> Result<()> {
        if self.calibration.take().is_some() {
            warn!("Body calibration interrupted by deinit");
            self.calibration_status = BodyCalibrationStatus::Idle;
        }
        self.legs.iter_mut().try_for_each(Leg::deinit)?;
        self.ears.iter_mut().try_for_each(Joint::deinit)
    }

    /// One control tick: advance the calibration sequence, then every joint
    pub fn update(&mut self) -> Result<()> {
        self.poll_calibration();
        self.legs.iter_mut().try_for_each(Leg::update)?;
        self.ears.iter_mut().try_for_each(Joint::update)
    }

    pub fn enable(&mut self) -> Result<()> {
        self.legs.iter_mut().try_for_each(Leg::enable)?;
        self.ears.iter_mut().try_for_each(Joint::enable)
    }

    pub fn disable(&mut self) -> Result<()> {
        self.legs.iter_mut().try_for_each(Leg::disable)?;
        self.ears.iter_mut().try_for_each(Joint::disable)
    }

    pub fn set_posture(&mut self, posture: Transform) -> Result<()> {
        let previous = std::mem::replace(&mut self.posture, posture);
        if let Err(e) = self.apply_posture() {
            self.posture = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn target_posture(&self) -> &Transform {
        &self.posture
    }

    /// Move one foot (world frame, mm). All legs are re-timed.
    pub fn set_feet_position(&mut self, leg: LegIndex, position: Vec3) -> Result<()> {
        let previous = std::mem::replace(&mut self.feet_positions[leg.index()], position);
        if let Err(e) = self.apply_posture() {
            self.feet_positions[leg.index()] = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn feet_position(&self, leg: LegIndex) -> Vec3 {
        self.feet_positions[leg.index()]
    }

    /// Solve every leg for the current posture and feet, then command them to
    /// arrive together at the pace of the slowest one. Nothing is commanded if
    /// any leg rejects its target.
    fn apply_posture(&mut self) -> Result<()> {
        let mut plans = [LegAngles::default(); 4];
        let mut max_time_s = 0.0f32;

        for leg_index in LegIndex::ALL {
            let i = leg_index.index();
            let foot_in_body = self.posture.world_to_local(&self.feet_positions[i]);
            let target = foot_in_body - leg_index.hip_position();
            let leg = &self.legs[i];
            plans[i] = leg.solve(&target).inspect_err(|e| {
                error!("Leg {:?}: target {:?} rejected: {}", leg_index, target, e);
            })?;
            max_time_s = max_time_s.max(leg.angles_time_estimate(&plans[i]));
        }

        for (leg, angles) in self.legs.iter_mut().zip(plans.iter()) {
            leg.apply_timed(angles, max_time_s)?;
        }
        Ok(())
    }

    /// Cap the velocity of every joint, 0 removes the cap
    pub fn clamp_velocity(&mut self, max: f32) -> Result<()> {
        for leg in self.legs.iter_mut() {
            leg.joints_mut()
                .iter_mut()
                .try_for_each(|joint| joint.clamp_velocity(max))?;
        }
        self.ears
            .iter_mut()
            .try_for_each(|joint| joint.clamp_velocity(max))
    }

    pub fn leg(&self, leg: LegIndex) -> &Leg {
        &self.legs[leg.index()]
    }

    pub fn leg_mut(&mut self, leg: LegIndex) -> &mut Leg {
        &mut self.legs[leg.index()]
    }

    pub fn ear(&self, ear: EarIndex) -> &Joint {
        &self.ears[ear.index()]
    }

    pub fn ear_mut(&mut self, ear: EarIndex) -> &mut Joint {
        &mut self.ears[ear.index()]
    }

    pub fn joint_table(&self) -> &JointTable {
        &self.joint_table
    }

    /// Joint driven by a motor channel
    pub fn joint(&self, channel: u8) -> Result<&Joint> {
        Ok(match self.joint_table.lookup(channel)? {
            JointId::Leg { leg, joint } => self.legs[leg.index()].joint(joint),
            JointId::Ear { ear } => &self.ears[ear.index()],
        })
    }

    pub fn joint_mut(&mut self, channel: u8) -> Result<&mut Joint> {
        Ok(match self.joint_table.lookup(channel)? {
            JointId::Leg { leg, joint } => self.legs[leg.index()].joint_mut(joint),
            JointId::Ear { ear } => &mut self.ears[ear.index()],
        })
    }

    fn joints_mut(&mut self) -> impl Iterator<Item = &mut Joint> {
        self.legs
            .iter_mut()
            .flat_map(|leg| leg.joints_mut().iter_mut())
            .chain(self.ears.iter_mut())
    }

    /// Calibrate every leg joint, one leg at a time. Progress is driven by `update`.
    pub fn start_calibration(&mut self) -> Result<()> {
        if self.is_calibrating() {
            return Err(Error::InvalidState(
                "body calibration already running".to_string(),
            ));
        }
        if self.joints_mut().any(|joint| joint.controller().is_calibrating()) {
            return Err(Error::InvalidState(
                "a motor calibration is already running".to_string(),
            ));
        }

        info!("Body calibration started");
        let sequence = CalibrationSequence {
            leg: LegIndex::FrontLeft,
            step: CalibrationStep::Prepare,
        };
        self.calibration_status = BodyCalibrationStatus::Running {
            leg: sequence.leg,
            joint: None,
        };
        self.calibration = Some(sequence);
        Ok(())
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration_status(&self) -> &BodyCalibrationStatus {
        &self.calibration_status
    }

    /// Block until every running motor calibration thread has exited
    pub fn join_calibration_tasks(&mut self) {
        for joint in self.joints_mut() {
            let controller = joint.controller_mut();
            if controller.is_calibrating() {
                // outcome is read back from the calibration state
                let _ = controller.wait_calibration();
            }
        }
    }

    fn poll_calibration(&mut self) {
        let Some(mut sequence) = self.calibration.take() else {
            return;
        };
        let (leg, joint) = (sequence.leg, sequence.step.joint());

        match self.step_calibration(&mut sequence) {
            Ok(true) => {
                self.calibration_status = BodyCalibrationStatus::Running {
                    leg: sequence.leg,
                    joint: sequence.step.joint(),
                };
                self.calibration = Some(sequence);
            }
            Ok(false) => {
                info!("Body calibration completed");
                self.calibration_status = BodyCalibrationStatus::Completed;
            }
            Err(e) => {
                error!("Body calibration aborted on {:?} {:?}: {}", leg, joint, e);
                self.calibration_status = BodyCalibrationStatus::Failed {
                    leg,
                    joint,
                    reason: e.to_string(),
                };
                if let Err(e) = self.disable() {
                    error!("Failed to release joints after calibration abort: {}", e);
                }
            }
        }
    }

    /// Advance the sequence by one step, false once every leg is done
    fn step_calibration(&mut self, sequence: &mut CalibrationSequence) -> Result<bool> {
        let now = self.clock.now();
        let leg_index = sequence.leg;

        match sequence.step {
            CalibrationStep::Prepare => {
                info!("Calibrating leg {:?}", leg_index);
                self.disable()?;
                sequence.step = CalibrationStep::Start(LegJoint::HipRoll);
            }
            CalibrationStep::Start(joint) => {
                self.legs[leg_index.index()]
                    .joint_mut(joint)
                    .controller_mut()
                    .start_calibration()?;
                sequence.step = CalibrationStep::Await(joint);
            }
            CalibrationStep::Await(which) => {
                let leg = &mut self.legs[leg_index.index()];
                let joint = leg.joint_mut(which);
                if joint.controller().is_calibrating() {
                    return Ok(true);
                }
                if joint.controller().calibration_state() != CalibrationState::Calibrated {
                    return Err(joint
                        .controller()
                        .last_calibration_failure()
                        .map(|(_, e)| e)
                        .unwrap_or_else(|| {
                            Error::InvalidState(format!(
                                "motor {} not calibrated",
                                joint.channel()
                            ))
                        }));
                }
                joint.enable()?;

                let next = match which {
                    LegJoint::HipRoll => Some((SAFE_HIP_ROLL, LegJoint::HipPitch)),
                    LegJoint::HipPitch => Some((safe_hip_pitch(leg_index), LegJoint::KneePitch)),
                    LegJoint::KneePitch => None,
                };
                sequence.step = match next {
                    Some((angle, next)) => {
                        let time_s = joint.time_estimate(angle);
                        joint.set_target(angle)?;
                        CalibrationStep::Settle {
                            next,
                            until: now + Duration::from_secs_f32(time_s) + CALIBRATION_SETTLE,
                        }
                    }
                    None => {
                        let pose = [
                            (LegJoint::HipRoll, SAFE_HIP_ROLL),
                            (LegJoint::HipPitch, safe_hip_pitch(leg_index)),
                            (LegJoint::KneePitch, RETRACT_KNEE),
                        ];
                        let mut time_s = 0.0f32;
                        for (which, angle) in pose {
                            let joint = leg.joint_mut(which);
                            time_s = time_s.max(joint.time_estimate(angle));
                            joint.set_target(angle)?;
                        }
                        CalibrationStep::Retract {
                            until: now + Duration::from_secs_f32(time_s) + CALIBRATION_SETTLE,
                        }
                    }
                };
            }
            CalibrationStep::Settle { next, until } => {
                if now >= until {
                    sequence.step = CalibrationStep::Start(next);
                }
            }
            CalibrationStep::Retract { until } => {
                if now >= until {
                    match LegIndex::from_index(leg_index.index() + 1) {
                        Some(next) => {
                            sequence.leg = next;
                            sequence.step = CalibrationStep::Prepare;
                        }
                        None => return Ok(false),
                    }
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{SimRig, State};
    use approx::assert_abs_diff_eq;

    fn body(rig: &SimRig) -> Body {
        let mut body = Body::new(&rig.hw).unwrap();
        body.init().unwrap();
        body
    }

    fn standing(rig: &SimRig) -> Body {
        let mut body = body(rig);
        body.enable().unwrap();
        let posture = *body.target_posture();
        body.set_posture(posture).unwrap();
        body
    }

    fn run_calibration(rig: &SimRig, body: &mut Body) {
        body.start_calibration().unwrap();
        for _ in 0..5000 {
            body.update().unwrap();
            body.join_calibration_tasks();
            if !body.is_calibrating() {
                return;
            }
            rig.clock.advance(Duration::from_millis(20));
        }
        panic!("body calibration did not finish");
    }

    #[test]
    fn test_joint_table_covers_wiring() {
        let rig = SimRig::new(5);
        let body = Body::new(&rig.hw).unwrap();
        assert_eq!(body.joint_table().iter().count(), 14);
        assert_eq!(
            body.joint_table().lookup(5).unwrap(),
            JointId::Leg {
                leg: LegIndex::FrontLeft,
                joint: LegJoint::HipPitch
            }
        );
        assert_eq!(
            body.joint_table().lookup(0).unwrap(),
            JointId::Ear { ear: EarIndex::Right }
        );
        assert!(matches!(body.joint_table().lookup(14), Err(Error::NotFound(_))));
        assert!(matches!(body.joint(99), Err(Error::NotFound(_))));
        assert_eq!(body.joint(12).unwrap().channel(), 12);
    }

    #[test]
    fn test_joint_table_rejects_duplicates() {
        let mut table = JointTable::new();
        table.register(3, JointId::Ear { ear: EarIndex::Left }).unwrap();
        assert!(matches!(
            table.register(3, JointId::Ear { ear: EarIndex::Right }),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            table.register(16, JointId::Ear { ear: EarIndex::Right }),
            Err(Error::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_default_posture_is_neutral_stance() {
        let rig = SimRig::new(5);
        let body = standing(&rig);
        for leg in LegIndex::ALL {
            let hip_pitch = body.leg(leg).joint(LegJoint::HipPitch).target();
            let knee = body.leg(leg).joint(LegJoint::KneePitch).target();
            assert_abs_diff_eq!(body.leg(leg).joint(LegJoint::HipRoll).target(), 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(hip_pitch, -0.75f32.acos(), epsilon = 1e-4);
            assert_abs_diff_eq!(knee, 2.0 * 0.75f32.acos(), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_single_foot_change_retimes_every_leg() {
        let rig = SimRig::new(5);
        let mut body = standing(&rig);
        body.set_feet_position(LegIndex::FrontLeft, Vec3::new(95.0, 80.0, 15.0))
            .unwrap();

        let times: Vec<f32> = LegIndex::ALL
            .iter()
            .map(|&leg| body.leg(leg).commanded_time())
            .collect();
        assert!(times[0] > 0.0);
        assert!(times.iter().all(|&t| t == times[0]), "times {:?}", times);

        // the moved leg sets the pace
        let slowest = body
            .leg(LegIndex::FrontLeft)
            .time_estimate(&Vec3::new(20.0, 35.0, -75.0))
            .unwrap();
        assert_abs_diff_eq!(times[0], slowest, epsilon = 1e-5);
    }

    #[test]
    fn test_rejected_foot_keeps_previous_targets() {
        let rig = SimRig::new(5);
        let mut body = standing(&rig);
        let targets: Vec<f32> = LegIndex::ALL
            .iter()
            .flat_map(|&leg| body.leg(leg).joints().iter().map(Joint::target).collect::<Vec<_>>())
            .collect();

        let result = body.set_feet_position(LegIndex::BackRight, Vec3::new(-75.0, -80.0, -200.0));
        assert!(matches!(result, Err(Error::Unreachable { .. })));
        assert_eq!(
            body.feet_position(LegIndex::BackRight),
            LegIndex::BackRight.default_foot_position()
        );

        let lowered = Transform::new(Vec3::new(0.0, 0.0, 300.0), Quat::identity());
        assert!(body.set_posture(lowered).is_err());
        assert_eq!(body.target_posture().position.z, DEFAULT_BODY_HEIGHT_MM);

        let after: Vec<f32> = LegIndex::ALL
            .iter()
            .flat_map(|&leg| body.leg(leg).joints().iter().map(Joint::target).collect::<Vec<_>>())
            .collect();
        assert_eq!(targets, after);
    }

    #[test]
    fn test_posture_roll_tilts_feet() {
        let rig = SimRig::new(5);
        let mut body = standing(&rig);
        let rolled = Transform::from_euler(
            Vec3::new(0.0, 0.0, DEFAULT_BODY_HEIGHT_MM),
            0.1,
            0.0,
            0.0,
        );
        body.set_posture(rolled).unwrap();
        let left = body.leg(LegIndex::FrontLeft).joint(LegJoint::KneePitch).target();
        let right = body.leg(LegIndex::FrontRight).joint(LegJoint::KneePitch).target();
        assert!((left - right).abs() > 0.05);
    }

    #[test]
    fn test_clamp_velocity_reaches_every_joint() {
        let rig = SimRig::new(5);
        let mut body = body(&rig);
        assert!(body.clamp_velocity(-2.0).is_err());
        body.clamp_velocity(1.0).unwrap();
        body.enable().unwrap();
        let start = body.ear(EarIndex::Left).prediction();
        body.ear_mut(EarIndex::Left).set_target(start + 0.5).unwrap();
        rig.clock.advance(Duration::from_millis(20));
        body.update().unwrap();
        assert_abs_diff_eq!(body.ear(EarIndex::Left).prediction(), start + 0.02, epsilon = 1e-5);
    }

    #[test]
    fn test_body_calibration_runs_leg_by_leg() {
        let rig = SimRig::new(5);
        let mut body = body(&rig);
        run_calibration(&rig, &mut body);

        assert_eq!(body.calibration_status(), &BodyCalibrationStatus::Completed);
        for leg in LegIndex::ALL {
            for joint in body.leg(leg).joints() {
                assert_eq!(joint.controller().calibration_state(), CalibrationState::Calibrated);
            }
        }
        // ears are not part of the sequence
        assert_eq!(
            body.ear(EarIndex::Left).controller().calibration_state(),
            CalibrationState::Uncalibrated
        );

        // last leg is left folded, earlier legs were released
        let last = body.leg(LegIndex::BackRight);
        assert!(last.joints().iter().all(Joint::is_enabled));
        assert_abs_diff_eq!(last.joint(LegJoint::KneePitch).target(), RETRACT_KNEE);
        assert_abs_diff_eq!(last.joint(LegJoint::HipPitch).target(), -SAFE_HIP_PITCH);
        assert!(!body.leg(LegIndex::FrontLeft).joint(LegJoint::HipRoll).is_enabled());
    }

    #[test]
    fn test_body_calibration_aborts_on_joint_failure() {
        let rig = SimRig::new(5);
        // front-left hip pitch
        rig.board.set_noise(5, 0);
        rig.board.set_stuck(5, true);
        let mut body = body(&rig);
        run_calibration(&rig, &mut body);

        match body.calibration_status() {
            BodyCalibrationStatus::Failed { leg, joint, .. } => {
                assert_eq!(*leg, LegIndex::FrontLeft);
                assert_eq!(*joint, Some(LegJoint::HipPitch));
            }
            other => panic!("unexpected status {:?}", other),
        }
        let front_left = body.leg(LegIndex::FrontLeft);
        assert_eq!(
            front_left.joint(LegJoint::HipRoll).controller().calibration_state(),
            CalibrationState::Calibrated
        );
        assert_eq!(
            front_left.joint(LegJoint::KneePitch).controller().calibration_state(),
            CalibrationState::Uncalibrated
        );
        for joint in body.leg(LegIndex::FrontRight).joints() {
            assert_eq!(joint.controller().calibration_state(), CalibrationState::Uncalibrated);
        }
        assert!(front_left
            .joints()
            .iter()
            .all(|joint| joint.controller().state() == State::Disabled));
    }

    #[test]
    fn test_second_calibration_start_rejected() {
        let rig = SimRig::new(5);
        let mut body = body(&rig);
        body.start_calibration().unwrap();
        assert!(matches!(body.start_calibration(), Err(Error::InvalidState(_))));
        assert_eq!(
            body.calibration_status(),
            &BodyCalibrationStatus::Running {
                leg: LegIndex::FrontLeft,
                joint: None
            }
        );
        body.deinit().unwrap();
        assert!(!body.is_calibrating());
    }
}
