//! Basic geometry of the arm, including conversion between Cartesian
//! coordinates, joint angles and servo encoder positions.
//!
//! The arm is a chain of four links: the "base" turns the whole arm around
//! the vertical axis, and then the "upperarm", "forearm" and "hand" all bend
//! in the vertical plane picked out by the base. On the end of the hand there
//! is a gripper, and between the hand and the gripper there is one more servo
//! that spins the gripper around (the "hand orientation").
//!
//! This crate supports `no_std` and uses `libm` for its trigonometry, so that
//! the solver can also run next to the servo controller.

#![cfg_attr(not(feature = "std"), no_std)]

use serde::{Deserialize, Serialize};

pub mod fk;
pub mod ik;

pub use fk::{forward, forward_angles};
pub use ik::{IkConfig, IkError, InverseKinematics, Solution};

pub type Angle = euclid::Angle<f64>;
pub type Point = euclid::Point3D<f64, Mm>;
pub type Vector = euclid::Vector3D<f64, Mm>;

/// Unit tag for millimetres in the arm's base frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mm;

/// How many degrees one encoder unit turns a servo.
pub const DEGREES_PER_UNIT: f64 = 0.24;

/// Encoder value of a servo sitting at its zero angle.
pub const ENCODER_CENTER: u16 = 500;

/// Largest encoder value a servo accepts.
pub const ENCODER_MAX: u16 = 1000;

/// A single rigid segment of the arm, together with the range of angles
/// that the joint at its base can reach.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Length of the segment, in millimetres.
    pub length: f64,
    /// Smallest allowed joint angle, in radians.
    pub angle_low: f64,
    /// Largest allowed joint angle, in radians.
    pub angle_high: f64,
}

impl Link {
    pub const fn new(length: f64, angle_low: f64, angle_high: f64) -> Self {
        Link {
            length,
            angle_low,
            angle_high,
        }
    }

    pub fn in_range(&self, angle: f64) -> bool {
        self.angle_low <= angle && angle <= self.angle_high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KinematicChain {
    /// The turntable. Its length is the height of the shoulder joint above
    /// the origin of the base frame.
    pub base: Link,
    pub upperarm: Link,
    pub forearm: Link,
    /// From the wrist joint to the tip of the gripper.
    pub hand: Link,
}

impl Default for KinematicChain {
    fn default() -> Self {
        ChainBuilder::default().build()
    }
}

pub struct ChainBuilder {
    base: Link,
    upperarm: Link,
    forearm: Link,
    hand: Link,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self {
            base: Link::new(0.0, -1.57, 1.57),
            upperarm: Link::new(97.0, -1.75, 1.75),
            forearm: Link::new(95.5, -1.75, 1.75),
            hand: Link::new(150.0, -1.75, 1.75),
        }
    }
}

impl ChainBuilder {
    pub fn build(&self) -> KinematicChain {
        KinematicChain {
            base: self.base,
            upperarm: self.upperarm,
            forearm: self.forearm,
            hand: self.hand,
        }
    }

    pub fn with_base(&mut self, base: Link) -> &mut Self {
        self.base = base;
        self
    }

    pub fn with_upperarm(&mut self, upperarm: Link) -> &mut Self {
        self.upperarm = upperarm;
        self
    }

    pub fn with_forearm(&mut self, forearm: Link) -> &mut Self {
        self.forearm = forearm;
        self
    }

    pub fn with_hand(&mut self, hand: Link) -> &mut Self {
        self.hand = hand;
        self
    }
}

/// Joint angles, in radians, as produced by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointAngles {
    pub base: f64,
    pub shoulder: f64,
    pub elbow: f64,
    pub wrist: f64,
}

impl JointAngles {
    pub fn within(&self, chain: &KinematicChain) -> bool {
        chain.base.in_range(self.base)
            && chain.upperarm.in_range(self.shoulder)
            && chain.forearm.in_range(self.elbow)
            && chain.hand.in_range(self.wrist)
    }
}

/// Which joint an encoder value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Joint {
    Base,
    Shoulder,
    Elbow,
    Wrist,
    Hand,
}

impl Joint {
    /// All the arm joints, in logical order (from the base outwards).
    pub const ALL: [Joint; 5] = [
        Joint::Base,
        Joint::Shoulder,
        Joint::Elbow,
        Joint::Wrist,
        Joint::Hand,
    ];
}

impl core::fmt::Display for Joint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Joint::Base => "base",
            Joint::Shoulder => "shoulder",
            Joint::Elbow => "elbow",
            Joint::Wrist => "wrist",
            Joint::Hand => "hand",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{joint} position {value} is outside [0, 1000]")]
pub struct EncoderError {
    pub joint: Joint,
    pub value: i32,
}

/// The positions of the five arm servos, in the units that the servos
/// understand. Each one is in `[0, 1000]`, and 500 is the middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderPosition {
    pub base: u16,
    pub shoulder: u16,
    pub elbow: u16,
    pub wrist: u16,
    /// Rotation of the gripper around the hand.
    pub hand: u16,
}

impl Default for EncoderPosition {
    fn default() -> Self {
        EncoderPosition::from_array([ENCODER_CENTER; 5])
    }
}

fn check_encoder(joint: Joint, value: i32) -> Result<u16, EncoderError> {
    if (0..=ENCODER_MAX as i32).contains(&value) {
        Ok(value as u16)
    } else {
        Err(EncoderError { joint, value })
    }
}

impl EncoderPosition {
    /// Takes raw values in logical joint order and checks that they're in range.
    pub fn new(values: [i32; 5]) -> Result<Self, EncoderError> {
        let mut checked = [0u16; 5];
        for ((out, value), joint) in checked.iter_mut().zip(values).zip(Joint::ALL) {
            *out = check_encoder(joint, value)?;
        }
        Ok(EncoderPosition::from_array(checked))
    }

    pub fn from_array(values: [u16; 5]) -> Self {
        let [base, shoulder, elbow, wrist, hand] = values;
        EncoderPosition {
            base,
            shoulder,
            elbow,
            wrist,
            hand,
        }
    }

    pub fn to_array(&self) -> [u16; 5] {
        [self.base, self.shoulder, self.elbow, self.wrist, self.hand]
    }

    /// Returns the first joint whose value isn't a valid servo position.
    pub fn validate(&self) -> Result<(), EncoderError> {
        for (value, joint) in self.to_array().into_iter().zip(Joint::ALL) {
            check_encoder(joint, value as i32)?;
        }
        Ok(())
    }

    /// Converts joint angles to servo positions, with the hand orientation
    /// taken as given.
    pub fn from_angles(angles: &JointAngles, hand: i32) -> Result<Self, EncoderError> {
        EncoderPosition::new([
            angle_to_units(angles.base) + ENCODER_CENTER as i32,
            angle_to_units(angles.shoulder) + ENCODER_CENTER as i32,
            // The elbow servo is mounted the other way around.
            ENCODER_CENTER as i32 - angle_to_units(angles.elbow),
            angle_to_units(angles.wrist) + ENCODER_CENTER as i32,
            hand,
        ])
    }

    /// The inverse of [`EncoderPosition::from_angles`], up to the rounding
    /// to whole encoder units. The hand orientation doesn't affect the
    /// geometry, so it's dropped.
    pub fn to_angles(&self) -> JointAngles {
        let centered = |v: u16| v as i32 - ENCODER_CENTER as i32;
        JointAngles {
            base: units_to_angle(centered(self.base)),
            shoulder: units_to_angle(centered(self.shoulder)),
            elbow: units_to_angle(-centered(self.elbow)),
            wrist: units_to_angle(centered(self.wrist)),
        }
    }
}

/// Converts an angle (in radians) to a whole number of encoder units.
pub fn angle_to_units(radians: f64) -> i32 {
    libm::round(Angle::radians(radians).to_degrees() / DEGREES_PER_UNIT) as i32
}

pub fn units_to_angle(units: i32) -> f64 {
    Angle::degrees(units as f64 * DEGREES_PER_UNIT).radians
}

/// How the end of the hand should point when it gets to the target.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum ApproachAngle {
    /// Any orientation will do; the solver gets to pick.
    #[default]
    Free,
    /// The angle of the hand in the arm's plane: zero points straight out
    /// from the base, positive angles point upwards.
    Fixed(Angle),
}

impl ApproachAngle {
    pub fn from_degrees(degrees: f64) -> Self {
        ApproachAngle::Fixed(Angle::degrees(degrees))
    }
}
