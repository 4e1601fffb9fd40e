//! The wire format spoken by the servo controller board.
//!
//! Every message is a [`Frame`]: two `0x55` bytes, a length, a command id
//! and then a command-specific payload. Multi-byte fields are little-endian.
//! Nothing in here does any I/O.

#![cfg_attr(not(test), no_std)]

mod frame;

pub use frame::{
    decode_query_response, decode_request, encode_move, encode_query, encode_query_response,
    encode_unload, Frame, Request, ServoIds, ServoPositions,
};

pub const FRAME_HEADER: u8 = 0x55;

/// The board drives at most six servos: the gripper and five arm joints.
pub const MAX_SERVOS: usize = 6;

/// Header, length, command, count, duration and one group per servo.
pub const MAX_FRAME_LEN: usize = 7 + 3 * MAX_SERVOS;

pub const MAX_POSITION: u16 = 1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Move = 0x03,
    Unload = 0x14,
    PositionRead = 0x15,
}

impl TryFrom<u8> for CommandId {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x03 => Ok(CommandId::Move),
            0x14 => Ok(CommandId::Unload),
            0x15 => Ok(CommandId::PositionRead),
            _ => Err(ProtocolError::MalformedFrame),
        }
    }
}

/// The bus address of a servo.
///
/// The bus numbers the servos from the gripper inwards, which is the
/// opposite of the order in which we number the joints.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServoId(u8);

impl ServoId {
    pub const GRIPPER: ServoId = ServoId(1);
    pub const HAND: ServoId = ServoId(2);
    pub const WRIST: ServoId = ServoId(3);
    pub const ELBOW: ServoId = ServoId(4);
    pub const SHOULDER: ServoId = ServoId(5);
    pub const BASE: ServoId = ServoId(6);

    /// The arm servos, in joint order (base first).
    pub const ARM: [ServoId; 5] = [
        ServoId::BASE,
        ServoId::SHOULDER,
        ServoId::ELBOW,
        ServoId::WRIST,
        ServoId::HAND,
    ];

    pub const ALL: [ServoId; 6] = [
        ServoId::GRIPPER,
        ServoId::HAND,
        ServoId::WRIST,
        ServoId::ELBOW,
        ServoId::SHOULDER,
        ServoId::BASE,
    ];

    pub fn new(id: u8) -> Result<Self, ProtocolError> {
        if (1..=MAX_SERVOS as u8).contains(&id) {
            Ok(ServoId(id))
        } else {
            Err(ProtocolError::InvalidServoId(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl core::fmt::Display for ServoId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "servo {}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("duration must be greater than 0")]
    InvalidDuration,
    #[error("position {0} is outside [0, 1000]")]
    OutOfRangePosition(u16),
    #[error("got {ids} servo ids but {positions} positions")]
    LengthMismatch { ids: usize, positions: usize },
    #[error("a frame addresses between 1 and 6 servos, not {0}")]
    ServoCount(usize),
    #[error("no servo has id {0}")]
    InvalidServoId(u8),
    #[error("malformed frame")]
    MalformedFrame,
}
