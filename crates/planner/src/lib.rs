//! Turns high-level arm motions into a sequence of servo commands.
//!
//! There's no smoothing here: a linear move is cut into waypoints, and each
//! waypoint becomes one independent, linear-in-time servo move.

use brazo_geom::{
    fk, ApproachAngle, EncoderPosition, IkError, InverseKinematics, KinematicChain, Point, Vector,
    ENCODER_MAX,
};
use brazo_protocol::{
    decode_query_response, encode_move, encode_query, encode_unload, ProtocolError, ServoId,
};
use serde::{Deserialize, Serialize};

mod bus;
pub mod waypoints;

pub use bus::{ServoBus, TransportError};

/// Where the gripper goes when it opens.
pub const GRIP_OPEN: u16 = 200;

/// Where the gripper goes when it closes, unless told otherwise.
pub const GRIP_CLOSED: u16 = 650;

/// How long the gripper takes to open or close, at full speed.
pub const GRIP_DURATION_MS: u32 = 1000;

/// How long it takes to re-command the current pose when powering up.
pub const MOTORS_ON_DURATION_MS: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("speed must be in (0, 10], not {0}")]
    InvalidSpeed(f64),
    #[error("duration {0} ms is outside (0, 65535]")]
    InvalidDuration(u64),
    #[error("position {0} is outside [0, 1000]")]
    OutOfRangePosition(u16),
    #[error("waypoint {waypoint} is unreachable")]
    UnreachableGoal {
        /// Which waypoint failed, counting from 1.
        waypoint: u32,
        #[source]
        source: IkError,
    },
    #[error("malformed frame: {0}")]
    MalformedFrame(ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<ProtocolError> for PlannerError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidDuration => PlannerError::InvalidDuration(0),
            ProtocolError::OutOfRangePosition(p) => PlannerError::OutOfRangePosition(p),
            e => PlannerError::MalformedFrame(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlannerError>;

/// A multiplier on the duration of every move: at speed 2, everything takes
/// half as long.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Speed(f64);

impl Speed {
    pub const MAX: f64 = 10.0;

    pub fn new(speed: f64) -> Result<Self> {
        // Also catches NaN.
        if speed > 0.0 && speed <= Speed::MAX {
            Ok(Speed(speed))
        } else {
            Err(PlannerError::InvalidSpeed(speed))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Splits `total_ms` into `parts` equal moves and scales by the speed,
    /// truncating to whole milliseconds.
    pub fn scale(self, total_ms: u32, parts: u32) -> Result<u16> {
        if total_ms == 0 || total_ms > u16::MAX as u32 {
            return Err(PlannerError::InvalidDuration(total_ms as u64));
        }
        let ms = (total_ms as f64 / parts.max(1) as f64 / self.0) as u64;
        if ms == 0 || ms > u16::MAX as u64 {
            return Err(PlannerError::InvalidDuration(ms));
        }
        Ok(ms as u16)
    }
}

impl Default for Speed {
    fn default() -> Self {
        Speed(1.0)
    }
}

/// When to solve the waypoints of a linear move.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// Solve each waypoint right before sending it. If a waypoint turns out
    /// to be unreachable, the arm stops at the previous one.
    #[default]
    JustInTime,
    /// Solve every waypoint up front, and don't move at all unless they're
    /// all reachable.
    Precomputed,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown dispatch policy {0:?} (expected \"just_in_time\" or \"precomputed\")")]
pub struct UnknownDispatch(String);

impl std::str::FromStr for Dispatch {
    type Err = UnknownDispatch;

    fn from_str(s: &str) -> std::result::Result<Self, UnknownDispatch> {
        match s {
            "just_in_time" | "jit" => Ok(Dispatch::JustInTime),
            "precomputed" => Ok(Dispatch::Precomputed),
            _ => Err(UnknownDispatch(s.to_owned())),
        }
    }
}

/// A straight-line move of the tip of the hand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearMove {
    pub target: Point,
    /// The total time for the whole move, before scaling by the speed.
    pub duration_ms: u32,
    /// The hand orientation servo position.
    pub orientation: u16,
    pub approach: ApproachAngle,
    /// How many pieces to cut the move into. With only one, the arm goes
    /// straight to the target in joint space, which isn't a straight line.
    pub waypoints: u32,
}

impl LinearMove {
    pub fn new(target: Point, duration_ms: u32) -> Self {
        LinearMove {
            target,
            duration_ms,
            orientation: brazo_geom::ENCODER_CENTER,
            approach: ApproachAngle::Free,
            waypoints: 1,
        }
    }

    pub fn with_orientation(mut self, orientation: u16) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_approach(mut self, approach: ApproachAngle) -> Self {
        self.approach = approach;
        self
    }

    pub fn with_waypoints(mut self, waypoints: u32) -> Self {
        self.waypoints = waypoints;
        self
    }
}

/// A point displaced by `delta`, for approaching a target from a safe
/// distance before moving in on it.
pub fn offset(point: Point, delta: Vector) -> Point {
    point + delta
}

fn check_position(position: u16) -> Result<u16> {
    if position <= ENCODER_MAX {
        Ok(position)
    } else {
        Err(PlannerError::OutOfRangePosition(position))
    }
}

pub struct MotionPlanner<B> {
    ik: InverseKinematics,
    speed: Speed,
    dispatch: Dispatch,
    bus: B,
}

impl<B: ServoBus> MotionPlanner<B> {
    pub fn new(bus: B, ik: InverseKinematics, dispatch: Dispatch) -> Self {
        MotionPlanner {
            ik,
            speed: Speed::default(),
            dispatch,
            bus,
        }
    }

    pub fn chain(&self) -> &KinematicChain {
        self.ik.chain()
    }

    pub fn speed(&self) -> f64 {
        self.speed.get()
    }

    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        self.speed = Speed::new(speed)?;
        Ok(())
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    pub fn set_dispatch(&mut self, dispatch: Dispatch) {
        self.dispatch = dispatch;
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Moves all five arm servos at once.
    pub async fn move_joint(&mut self, joints: EncoderPosition, duration_ms: u32) -> Result<()> {
        joints
            .validate()
            .map_err(|e| PlannerError::OutOfRangePosition(e.value as u16))?;
        let duration = self.speed.scale(duration_ms, 1)?;
        self.send_pose(&joints, duration).await
    }

    async fn send_pose(&mut self, joints: &EncoderPosition, duration: u16) -> Result<()> {
        let frame = encode_move(&ServoId::ARM, &joints.to_array(), duration)?;
        log::debug!("moving to {:?} in {duration} ms", joints.to_array());
        self.bus.send(frame).await?;
        Ok(())
    }

    /// Moves a single servo, leaving the others where they are.
    pub async fn move_servo(&mut self, id: ServoId, position: u16, duration_ms: u32) -> Result<()> {
        let position = check_position(position)?;
        let duration = self.speed.scale(duration_ms, 1)?;
        let frame = encode_move(&[id], &[position], duration)?;
        log::debug!("moving {id} to {position} in {duration} ms");
        self.bus.send(frame).await?;
        Ok(())
    }

    fn solve(&mut self, waypoint: u32, target: &Point, mv: &LinearMove) -> Result<EncoderPosition> {
        self.ik
            .solve(target, mv.approach, mv.orientation)
            .map(|solution| solution.encoders)
            .map_err(|source| PlannerError::UnreachableGoal { waypoint, source })
    }

    /// Moves the tip of the hand to `mv.target`.
    ///
    /// With more than one waypoint, this starts by asking the arm where it
    /// is, so that the waypoints can be spread along the line from there.
    pub async fn move_linear(&mut self, mv: &LinearMove) -> Result<()> {
        check_position(mv.orientation)?;
        let count = mv.waypoints.max(1);
        let duration = self.speed.scale(mv.duration_ms, count)?;

        if count == 1 {
            let joints = self.solve(1, &mv.target, mv)?;
            log::info!("moving to {:?}", mv.target);
            return self.send_pose(&joints, duration).await;
        }

        let start = self.cartesian_position().await?;
        log::info!(
            "moving from {:?} to {:?} through {count} waypoints",
            start,
            mv.target
        );
        let points = waypoints::interpolate(start, mv.target, count);

        match self.dispatch {
            Dispatch::JustInTime => {
                for (i, p) in (1..).zip(points) {
                    let joints = match self.solve(i, &p, mv) {
                        Ok(joints) => joints,
                        Err(e) => {
                            log::warn!("waypoint {i} of {count} is unreachable, stopping");
                            return Err(e);
                        }
                    };
                    self.send_pose(&joints, duration).await?;
                }
            }
            Dispatch::Precomputed => {
                let mut poses = Vec::with_capacity(count as usize);
                for (i, p) in (1..).zip(points) {
                    poses.push(self.solve(i, &p, mv)?);
                }
                for joints in &poses {
                    self.send_pose(joints, duration).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn grip_open(&mut self) -> Result<()> {
        self.move_servo(ServoId::GRIPPER, GRIP_OPEN, GRIP_DURATION_MS).await
    }

    pub async fn grip_close(&mut self, position: Option<u16>) -> Result<()> {
        let position = check_position(position.unwrap_or(GRIP_CLOSED))?;
        self.move_servo(ServoId::GRIPPER, position, GRIP_DURATION_MS).await
    }

    /// Asks the arm servos where they are.
    pub async fn position(&mut self) -> Result<EncoderPosition> {
        let frame = encode_query(&ServoId::ARM)?;
        let response = self.bus.request(frame).await?;
        let positions = decode_query_response(&response, &ServoId::ARM)?;

        let mut values = [0; 5];
        for (value, (_, position)) in values.iter_mut().zip(&positions) {
            *value = check_position(*position)?;
        }
        let joints = EncoderPosition::from_array(values);
        log::debug!("read position {values:?}");
        Ok(joints)
    }

    /// Where the tip of the hand is, according to the servos.
    pub async fn cartesian_position(&mut self) -> Result<Point> {
        let joints = self.position().await?;
        Ok(fk::forward(self.chain(), &joints))
    }

    /// Powers the servos back up, holding the arm wherever it currently is.
    pub async fn motors_on(&mut self) -> Result<()> {
        let joints = self.position().await?;
        log::info!("motors on");
        self.move_joint(joints, MOTORS_ON_DURATION_MS).await
    }

    /// Switches off all the servos, so that the arm can be moved by hand.
    pub async fn motors_off(&mut self) -> Result<()> {
        let frame = encode_unload(&ServoId::ALL)?;
        log::info!("motors off");
        self.bus.send(frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use brazo_protocol::{decode_request, encode_query_response, Frame, Request};

    use super::*;

    /// Records every frame, and answers queries like a (very fast) arm would.
    struct RecordingBus {
        positions: BTreeMap<ServoId, u16>,
        frames: Vec<Frame>,
    }

    impl RecordingBus {
        fn at(joints: [u16; 5]) -> Self {
            let mut positions: BTreeMap<_, _> = ServoId::ARM.into_iter().zip(joints).collect();
            positions.insert(ServoId::GRIPPER, 500);
            RecordingBus {
                positions,
                frames: Vec::new(),
            }
        }

        fn moves(&self) -> Vec<(u16, Vec<(ServoId, u16)>)> {
            self.frames
                .iter()
                .filter_map(|f| match decode_request(f.as_bytes()).unwrap() {
                    Request::Move {
                        duration_ms,
                        targets,
                    } => Some((duration_ms, targets.to_vec())),
                    _ => None,
                })
                .collect()
        }
    }

    impl ServoBus for RecordingBus {
        async fn send(&mut self, frame: Frame) -> std::result::Result<(), TransportError> {
            if let Request::Move { targets, .. } = decode_request(frame.as_bytes()).unwrap() {
                self.positions.extend(targets);
            }
            self.frames.push(frame);
            Ok(())
        }

        async fn request(&mut self, frame: Frame) -> std::result::Result<Vec<u8>, TransportError> {
            let Request::PositionRead(ids) = decode_request(frame.as_bytes()).unwrap() else {
                panic!("not a query");
            };
            let answer: Vec<_> = ids.iter().map(|id| (*id, self.positions[id])).collect();
            self.frames.push(frame);
            Ok(encode_query_response(&answer).unwrap().as_bytes().to_vec())
        }
    }

    fn planner(bus: RecordingBus) -> MotionPlanner<RecordingBus> {
        MotionPlanner::new(
            bus,
            InverseKinematics::new(KinematicChain::default()),
            Dispatch::JustInTime,
        )
    }

    // The pose that the solver finds for (130, -50, 40).
    const START: [u16; 5] = [412, 537, 726, 85, 500];

    #[test]
    fn speed_bounds() {
        for bad in [0.0, -1.0, 10.01, f64::NAN] {
            assert!(matches!(Speed::new(bad), Err(PlannerError::InvalidSpeed(_))));
        }
        for good in [10.0, 0.1, 1.0] {
            assert_eq!(Speed::new(good).unwrap().get(), good);
        }
    }

    #[test]
    fn speed_scaling() {
        let speed = Speed::new(3.0).unwrap();
        assert_eq!(speed.scale(1000, 1).unwrap(), 333);
        assert_eq!(speed.scale(1000, 4).unwrap(), 83);
        assert!(matches!(
            speed.scale(0, 1),
            Err(PlannerError::InvalidDuration(0))
        ));
        assert!(matches!(
            speed.scale(65536, 1),
            Err(PlannerError::InvalidDuration(65536))
        ));
        // Slowing down can push a valid duration out of range.
        let slow = Speed::new(0.1).unwrap();
        assert!(matches!(
            slow.scale(10000, 1),
            Err(PlannerError::InvalidDuration(100000))
        ));
        assert!(matches!(
            Speed::default().scale(3, 4),
            Err(PlannerError::InvalidDuration(0))
        ));
    }

    #[tokio::test]
    async fn rejected_speed_keeps_the_old_one() {
        let mut planner = planner(RecordingBus::at(START));
        planner.set_speed(2.5).unwrap();
        assert!(planner.set_speed(10.01).is_err());
        assert_eq!(planner.speed(), 2.5);

        assert_eq!(planner.dispatch(), Dispatch::JustInTime);
        planner.set_dispatch(Dispatch::Precomputed);
        assert_eq!(planner.dispatch(), Dispatch::Precomputed);
    }

    #[test]
    fn dispatch_names() {
        assert_eq!("precomputed".parse::<Dispatch>().unwrap(), Dispatch::Precomputed);
        assert_eq!("just_in_time".parse::<Dispatch>().unwrap(), Dispatch::JustInTime);
        assert!("eventually".parse::<Dispatch>().is_err());
    }

    #[tokio::test]
    async fn joint_move() {
        let mut planner = planner(RecordingBus::at([500; 5]));
        planner.set_speed(2.0).unwrap();
        planner
            .move_joint(EncoderPosition::from_array([1, 2, 3, 4, 5]), 1000)
            .await
            .unwrap();

        let moves = planner.bus().moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, 500);
        assert_eq!(
            moves[0].1,
            vec![
                (ServoId::BASE, 1),
                (ServoId::SHOULDER, 2),
                (ServoId::ELBOW, 3),
                (ServoId::WRIST, 4),
                (ServoId::HAND, 5)
            ]
        );
    }

    #[tokio::test]
    async fn validation_before_sending() {
        let mut planner = planner(RecordingBus::at([500; 5]));

        let mut joints = EncoderPosition::default();
        joints.elbow = 1001;
        assert!(matches!(
            planner.move_joint(joints, 1000).await,
            Err(PlannerError::OutOfRangePosition(1001))
        ));
        assert!(matches!(
            planner.move_joint(EncoderPosition::default(), 0).await,
            Err(PlannerError::InvalidDuration(0))
        ));
        assert!(matches!(
            planner.set_speed(0.0),
            Err(PlannerError::InvalidSpeed(_))
        ));
        assert!(matches!(
            planner.grip_close(Some(1200)).await,
            Err(PlannerError::OutOfRangePosition(1200))
        ));
        assert!(matches!(
            planner
                .move_linear(&LinearMove::new(Point::new(500.0, 0.0, 0.0), 1000))
                .await,
            Err(PlannerError::UnreachableGoal { waypoint: 1, .. })
        ));
        assert!(planner.bus().frames.is_empty());
    }

    #[tokio::test]
    async fn linear_move_through_waypoints() {
        let mut planner = planner(RecordingBus::at(START));
        let mv = LinearMove::new(Point::new(130.0, 50.0, 40.0), 1000).with_waypoints(4);
        planner.move_linear(&mv).await.unwrap();

        // One query for the starting point, and then the moves.
        assert_eq!(planner.bus().frames.len(), 5);
        let moves = planner.bus().moves();
        assert_eq!(moves.len(), 4);

        let chain = *planner.chain();
        let mut last_y = -50.0;
        for (duration, targets) in moves {
            assert_eq!(duration, 250);
            let values: Vec<u16> = targets.iter().map(|(_, p)| *p).collect();
            let joints = EncoderPosition::from_array(values.try_into().unwrap());
            let p = fk::forward(&chain, &joints);
            assert!(p.y > last_y);
            assert!((p.x - 130.0).abs() <= 2.0);
            assert!((p.z - 40.0).abs() <= 2.0);
            last_y = p.y;
        }
        assert!((last_y - 50.0).abs() <= 2.0);
    }

    #[tokio::test]
    async fn single_linear_move() {
        let mut planner = planner(RecordingBus::at(START));
        planner.set_speed(4.0).unwrap();
        let mv = LinearMove::new(Point::new(130.0, 50.0, 40.0), 1000);
        planner.move_linear(&mv).await.unwrap();

        // No need to know where we're starting from.
        assert_eq!(planner.bus().frames.len(), 1);
        let moves = planner.bus().moves();
        assert_eq!(moves[0].0, 250);
    }

    // Halfway there is (200, 100, 100), which is fine, but the target is out of reach.
    const TOO_FAR: Point = Point::new(270.0, 250.0, 160.0);

    #[tokio::test]
    async fn just_in_time_stops_early() {
        let mut planner = planner(RecordingBus::at(START));
        let mv = LinearMove::new(TOO_FAR, 1000).with_waypoints(2);
        assert!(matches!(
            planner.move_linear(&mv).await,
            Err(PlannerError::UnreachableGoal { waypoint: 2, .. })
        ));
        assert_eq!(planner.bus().moves().len(), 1);
    }

    #[tokio::test]
    async fn precomputed_is_all_or_nothing() {
        let mut planner = planner(RecordingBus::at(START));
        planner.set_dispatch(Dispatch::Precomputed);
        let mv = LinearMove::new(TOO_FAR, 1000).with_waypoints(2);
        assert!(matches!(
            planner.move_linear(&mv).await,
            Err(PlannerError::UnreachableGoal { waypoint: 2, .. })
        ));
        assert!(planner.bus().moves().is_empty());

        let mv = LinearMove::new(Point::new(130.0, 50.0, 40.0), 1000).with_waypoints(4);
        planner.move_linear(&mv).await.unwrap();
        assert_eq!(planner.bus().moves().len(), 4);
    }

    #[tokio::test]
    async fn gripper() {
        let mut planner = planner(RecordingBus::at(START));
        planner.set_speed(0.5).unwrap();
        planner.grip_open().await.unwrap();
        planner.grip_close(None).await.unwrap();
        planner.grip_close(Some(800)).await.unwrap();

        let moves = planner.bus().moves();
        let expected: Vec<(u16, Vec<(ServoId, u16)>)> = [200, 650, 800]
            .into_iter()
            .map(|p| (2000, vec![(ServoId::GRIPPER, p)]))
            .collect();
        assert_eq!(moves, expected);
    }

    #[tokio::test]
    async fn read_back() {
        let mut planner = planner(RecordingBus::at(START));
        assert_eq!(
            planner.position().await.unwrap(),
            EncoderPosition::from_array(START)
        );
        assert_eq!(
            planner.cartesian_position().await.unwrap(),
            Point::new(130.0, -50.0, 40.0)
        );
        assert_eq!(
            planner.bus().frames[0].as_bytes(),
            &[0x55, 0x55, 0x08, 0x15, 0x05, 6, 5, 4, 3, 2]
        );
    }

    #[tokio::test]
    async fn power() {
        let mut planner = planner(RecordingBus::at(START));
        planner.motors_off().await.unwrap();
        planner.motors_on().await.unwrap();

        let frames = &planner.bus().frames;
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[0].as_bytes(),
            &[0x55, 0x55, 0x09, 0x14, 0x06, 1, 2, 3, 4, 5, 6]
        );
        let moves = planner.bus().moves();
        assert_eq!(moves[0].0, 100);
        let values: Vec<u16> = moves[0].1.iter().map(|(_, p)| *p).collect();
        assert_eq!(values, START.to_vec());
    }

    #[tokio::test]
    async fn bad_telemetry() {
        let mut planner = planner(RecordingBus::at(START));
        planner.bus_mut().positions.insert(ServoId::WRIST, 1500);
        assert!(matches!(
            planner.position().await,
            Err(PlannerError::OutOfRangePosition(1500))
        ));
    }

    #[test]
    fn offsets() {
        let p = offset(Point::new(130.0, -50.0, 0.0), Vector::new(0.0, 0.0, 40.0));
        assert_eq!(p, Point::new(130.0, -50.0, 40.0));
    }
}
