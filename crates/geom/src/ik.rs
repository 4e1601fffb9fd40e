//! Inverse kinematics: from a point in the base frame to joint angles.
//!
//! The base angle is determined by the target alone. Once it's fixed the
//! rest of the arm lives in a plane, and if we know which way the hand
//! should point then the wrist position is determined too; the upperarm and
//! forearm are then two sides of a triangle with known side lengths, and
//! there are (at most) two ways to fold it.
//!
//! If the caller doesn't care which way the hand points, we try approach
//! angles one degree apart until one of them works.

use core::f64::consts::{FRAC_PI_2, PI, TAU};

use libm::{acos, atan2, cos, fabs, hypot, sin};

use crate::{
    angle_to_units, fk, Angle, ApproachAngle, EncoderError, EncoderPosition, JointAngles,
    KinematicChain, Point, ENCODER_CENTER,
};

/// Spacing between the approach angles tried when the approach is free.
pub const SEARCH_STEP: f64 = 0.01745329251;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum IkError {
    #[error("unreachable goal")]
    Unreachable,
    #[error(transparent)]
    OutOfRange(#[from] EncoderError),
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IkConfig {
    /// Run the solution back through forward kinematics before accepting it.
    pub verify: bool,
    /// How far (per axis, in millimetres) the verified point may be from the target.
    pub tolerance_mm: f64,
}

impl Default for IkConfig {
    fn default() -> Self {
        IkConfig {
            verify: true,
            tolerance_mm: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub angles: JointAngles,
    pub encoders: EncoderPosition,
    /// The approach angle that was solved for, measured in the arm's plane
    /// (so after any flip of the base).
    pub approach: Angle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PlaneSolution {
    shoulder: f64,
    elbow: f64,
    wrist: f64,
}

/// The inner angle (opposite the side `opposite`) of a triangle with the given sides.
fn cos_rule(opposite: f64, adjacent1: f64, adjacent2: f64) -> Option<f64> {
    let delta = 2.0 * adjacent1 * adjacent2;
    if delta == 0.0 {
        return None;
    }

    let cos = (adjacent1 * adjacent1 + adjacent2 * adjacent2 - opposite * opposite) / delta;
    if !(-1.0..=1.0).contains(&cos) {
        return None;
    }
    Some(acos(cos))
}

fn search_angles() -> impl Iterator<Item = f64> {
    (0u32..)
        .map(|k| -TAU + k as f64 * SEARCH_STEP)
        .take_while(|phi| *phi < TAU)
}

#[derive(Debug, Clone)]
pub struct InverseKinematics {
    chain: KinematicChain,
    config: IkConfig,
    // The last approach angle that worked for a free solve. Consecutive
    // targets tend to be close together, so it usually works again.
    last_approach: Option<f64>,
}

impl InverseKinematics {
    pub fn new(chain: KinematicChain) -> Self {
        Self::with_config(chain, IkConfig::default())
    }

    pub fn with_config(chain: KinematicChain, config: IkConfig) -> Self {
        InverseKinematics {
            chain,
            config,
            last_approach: None,
        }
    }

    pub fn chain(&self) -> &KinematicChain {
        &self.chain
    }

    pub fn last_approach(&self) -> Option<Angle> {
        self.last_approach.map(Angle::radians)
    }

    pub fn forget(&mut self) {
        self.last_approach = None;
    }

    /// Finds servo positions that put the tip of the hand at `target`.
    ///
    /// `orientation` is the requested rotation of the gripper. With a free
    /// approach angle it's passed straight through to the hand servo; with a
    /// fixed approach angle it's taken relative to the base, so that the
    /// gripper keeps its alignment as the base turns.
    pub fn solve(
        &mut self,
        target: &Point,
        approach: ApproachAngle,
        orientation: u16,
    ) -> Result<Solution, IkError> {
        let mut r = hypot(target.x, target.y);
        let mut base = atan2(target.y, target.x);
        let mut approach = approach;

        if !self.chain.base.in_range(base) {
            // Turn around and reach backwards instead.
            base += if base < 0.0 { PI } else { -PI };
            r = -r;
            if let ApproachAngle::Fixed(phi) = approach {
                approach = ApproachAngle::Fixed(Angle::radians(PI - phi.radians));
            }
            // Right out to the side, neither way round fits in the base's range.
            if !self.chain.base.in_range(base) {
                return Err(IkError::Unreachable);
            }
        }

        let height = target.z - self.chain.base.length;
        let (phi, plane) = match approach {
            ApproachAngle::Fixed(phi) => {
                let plane = self
                    .solve_plane(r, height, phi.radians)
                    .ok_or(IkError::Unreachable)?;
                (phi.radians, plane)
            }
            ApproachAngle::Free => self.solve_free(r, height).ok_or(IkError::Unreachable)?,
        };

        let angles = JointAngles {
            base,
            shoulder: plane.shoulder,
            elbow: plane.elbow,
            wrist: plane.wrist,
        };

        let hand = match approach {
            ApproachAngle::Fixed(_) => {
                let base_units = angle_to_units(base) + ENCODER_CENTER as i32;
                base_units + (ENCODER_CENTER as i32 - orientation as i32)
            }
            ApproachAngle::Free => orientation as i32,
        };
        let encoders = EncoderPosition::from_angles(&angles, hand)?;

        if self.config.verify {
            let reached = fk::forward(&self.chain, &encoders);
            let error = reached - *target;
            let tolerance = self.config.tolerance_mm;
            if fabs(error.x) > tolerance || fabs(error.y) > tolerance || fabs(error.z) > tolerance {
                log::warn!(
                    "solution for {target:?} only reaches {reached:?}, rejecting it",
                );
                return Err(IkError::Unreachable);
            }
        }

        if approach == ApproachAngle::Free {
            self.last_approach = Some(phi);
        }
        log::debug!("solved {target:?} with approach {phi:.4} rad: {encoders:?}");
        Ok(Solution {
            angles,
            encoders,
            approach: Angle::radians(phi),
        })
    }

    fn solve_free(&self, r: f64, z: f64) -> Option<(f64, PlaneSolution)> {
        if let Some(phi) = self.last_approach {
            if let Some(plane) = self.solve_plane(r, z, phi) {
                return Some((phi, plane));
            }
        }

        let found = search_angles().find_map(|phi| self.solve_plane(r, z, phi).map(|p| (phi, p)));
        match found {
            Some((phi, _)) => log::trace!("free approach search settled on {phi:.4} rad"),
            None => log::trace!("free approach search found nothing for r={r}, z={z}"),
        }
        found
    }

    /// Solves the planar part of the problem: `r` is the (signed) distance
    /// from the base axis and `z` is the height above the shoulder.
    fn solve_plane(&self, r: f64, z: f64, phi: f64) -> Option<PlaneSolution> {
        // Rotate so that the zero angle points straight up.
        let x = z;
        let y = -r;
        let phi = phi - FRAC_PI_2;

        let wrist_x = x - self.chain.hand.length * cos(phi);
        let wrist_y = y - self.chain.hand.length * sin(phi);

        let alpha = atan2(wrist_y, wrist_x);
        let reach = hypot(wrist_x, wrist_y);

        // Inner angle at the shoulder, and at the elbow.
        let beta = cos_rule(self.chain.forearm.length, reach, self.chain.upperarm.length)?;
        let gamma = cos_rule(reach, self.chain.upperarm.length, self.chain.forearm.length)?;

        let mut shoulder = alpha - beta;
        let mut elbow = PI - gamma;
        let mut wrist = phi - shoulder - elbow;

        if !self.plane_in_range(shoulder, elbow, wrist) {
            // Fold the elbow the other way.
            shoulder += 2.0 * beta;
            elbow = -elbow;
            wrist = phi - shoulder - elbow;

            if !self.plane_in_range(shoulder, elbow, wrist) {
                return None;
            }
        }

        Some(PlaneSolution {
            shoulder,
            elbow,
            wrist,
        })
    }

    fn plane_in_range(&self, shoulder: f64, elbow: f64, wrist: f64) -> bool {
        self.chain.upperarm.in_range(shoulder)
            && self.chain.forearm.in_range(elbow)
            && self.chain.hand.in_range(wrist)
    }
}
