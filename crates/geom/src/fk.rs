//! Forward kinematics: from joint positions back to the point that the tip
//! of the hand reaches.

use libm::{cos, round, sin};

use crate::{EncoderPosition, JointAngles, KinematicChain, Point};

/// Where the tip of the hand ends up for the given joint angles.
///
/// The arm's plane is measured the same way the inverse solver measures it:
/// the first coordinate points straight up and the second points backwards,
/// so that a shoulder angle of zero holds the upperarm vertical.
pub fn forward_angles(chain: &KinematicChain, angles: &JointAngles) -> Point {
    let segments = [
        (chain.upperarm.length, angles.shoulder),
        (chain.forearm.length, angles.elbow),
        (chain.hand.length, angles.wrist),
    ];

    let mut heading = 0.0;
    let (mut up, mut back) = (0.0, 0.0);
    for (length, angle) in segments {
        heading += angle;
        up += length * cos(heading);
        back += length * sin(heading);
    }

    let r = -back;
    let z = up + chain.base.length;
    Point::new(r * cos(angles.base), r * sin(angles.base), z)
}

/// Where the tip of the hand ends up for the given servo positions, rounded
/// to whole millimetres.
pub fn forward(chain: &KinematicChain, joints: &EncoderPosition) -> Point {
    let p = forward_angles(chain, &joints.to_angles());
    Point::new(round(p.x), round(p.y), round(p.z))
}
