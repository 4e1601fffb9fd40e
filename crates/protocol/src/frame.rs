use heapless::Vec;

use crate::{CommandId, ProtocolError, ServoId, FRAME_HEADER, MAX_FRAME_LEN, MAX_POSITION, MAX_SERVOS};

/// Servo positions as reported by the board (or requested in a move).
pub type ServoPositions = Vec<(ServoId, u16), MAX_SERVOS>;

pub type ServoIds = Vec<ServoId, MAX_SERVOS>;

/// One complete message on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    command: CommandId,
    bytes: Vec<u8, MAX_FRAME_LEN>,
}

impl Frame {
    fn new(command: CommandId) -> Self {
        let mut frame = Frame {
            command,
            bytes: Vec::new(),
        };
        // The length gets filled in by `finish`.
        frame.push(&[FRAME_HEADER, FRAME_HEADER, 0, command as u8]);
        frame
    }

    fn push(&mut self, bytes: &[u8]) {
        // Every constructor checks the servo count first, so this always fits.
        let pushed = self.bytes.extend_from_slice(bytes);
        debug_assert!(pushed.is_ok());
    }

    fn finish(mut self) -> Self {
        // The length counts everything after the header, including itself.
        self.bytes[2] = (self.bytes.len() - 2) as u8;
        self
    }

    pub fn command(&self) -> CommandId {
        self.command
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// For a move, how long the servos were told to take (in milliseconds).
    pub fn move_duration(&self) -> Option<u16> {
        match self.command {
            CommandId::Move => Some(u16::from_le_bytes([self.bytes[5], self.bytes[6]])),
            _ => None,
        }
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

fn check_count(count: usize) -> Result<(), ProtocolError> {
    if (1..=MAX_SERVOS).contains(&count) {
        Ok(())
    } else {
        Err(ProtocolError::ServoCount(count))
    }
}

fn check_position(position: u16) -> Result<(), ProtocolError> {
    if position <= MAX_POSITION {
        Ok(())
    } else {
        Err(ProtocolError::OutOfRangePosition(position))
    }
}

/// Tells each of the servos in `ids` to move to the matching position in
/// `positions`, taking `duration_ms` to get there.
pub fn encode_move(
    ids: &[ServoId],
    positions: &[u16],
    duration_ms: u16,
) -> Result<Frame, ProtocolError> {
    check_count(ids.len())?;
    if ids.len() != positions.len() {
        return Err(ProtocolError::LengthMismatch {
            ids: ids.len(),
            positions: positions.len(),
        });
    }
    if duration_ms == 0 {
        return Err(ProtocolError::InvalidDuration);
    }

    let mut frame = Frame::new(CommandId::Move);
    frame.push(&[ids.len() as u8]);
    frame.push(&duration_ms.to_le_bytes());
    for (id, &position) in ids.iter().zip(positions) {
        check_position(position)?;
        let [lo, hi] = position.to_le_bytes();
        frame.push(&[id.get(), lo, hi]);
    }
    Ok(frame.finish())
}

fn encode_id_list(command: CommandId, ids: &[ServoId]) -> Result<Frame, ProtocolError> {
    check_count(ids.len())?;

    let mut frame = Frame::new(command);
    frame.push(&[ids.len() as u8]);
    for id in ids {
        frame.push(&[id.get()]);
    }
    Ok(frame.finish())
}

/// Cuts the power to the given servos, so that they can be moved by hand.
pub fn encode_unload(ids: &[ServoId]) -> Result<Frame, ProtocolError> {
    encode_id_list(CommandId::Unload, ids)
}

/// Asks the board to report the positions of the given servos.
pub fn encode_query(ids: &[ServoId]) -> Result<Frame, ProtocolError> {
    encode_id_list(CommandId::PositionRead, ids)
}

/// The board's answer to [`encode_query`].
pub fn encode_query_response(positions: &[(ServoId, u16)]) -> Result<Frame, ProtocolError> {
    check_count(positions.len())?;

    let mut frame = Frame::new(CommandId::PositionRead);
    frame.push(&[positions.len() as u8]);
    for &(id, position) in positions {
        let [lo, hi] = position.to_le_bytes();
        frame.push(&[id.get(), lo, hi]);
    }
    Ok(frame.finish())
}

fn check_header(bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() < 5 || bytes[0] != FRAME_HEADER || bytes[1] != FRAME_HEADER {
        return Err(ProtocolError::MalformedFrame);
    }
    Ok(())
}

/// Reads the positions out of the board's answer to a query for `requested`.
///
/// The board answers in the order that the servos were asked for. Anything
/// after the last position (the transport might pad its reads) is ignored.
pub fn decode_query_response(
    bytes: &[u8],
    requested: &[ServoId],
) -> Result<ServoPositions, ProtocolError> {
    check_count(requested.len())?;
    check_header(bytes)?;

    let count = requested.len();
    if bytes.len() < 5 + 3 * count
        || bytes[3] != CommandId::PositionRead as u8
        || bytes[4] as usize != count
    {
        return Err(ProtocolError::MalformedFrame);
    }

    let mut ret = ServoPositions::new();
    for (group, &id) in bytes[5..].chunks_exact(3).zip(requested) {
        if group[0] != id.get() {
            return Err(ProtocolError::MalformedFrame);
        }
        let position = u16::from_le_bytes([group[1], group[2]]);
        // Can't overflow, because `count` was checked above.
        let _ = ret.push((id, position));
    }
    Ok(ret)
}

/// A command, as seen by the board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Move {
        duration_ms: u16,
        targets: ServoPositions,
    },
    Unload(ServoIds),
    PositionRead(ServoIds),
}

/// Parses a frame written to the board. This isn't needed for driving an
/// arm, but it lets us stand in for the board in simulations.
pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    check_header(bytes)?;
    if bytes[2] as usize + 2 != bytes.len() {
        return Err(ProtocolError::MalformedFrame);
    }

    let command = CommandId::try_from(bytes[3])?;
    let count = bytes[4] as usize;
    check_count(count)?;

    match command {
        CommandId::Move => {
            if bytes.len() != 7 + 3 * count {
                return Err(ProtocolError::MalformedFrame);
            }
            let duration_ms = u16::from_le_bytes([bytes[5], bytes[6]]);
            let mut targets = ServoPositions::new();
            for group in bytes[7..].chunks_exact(3) {
                let id = ServoId::new(group[0])?;
                let position = u16::from_le_bytes([group[1], group[2]]);
                check_position(position)?;
                let _ = targets.push((id, position));
            }
            Ok(Request::Move {
                duration_ms,
                targets,
            })
        }
        CommandId::Unload | CommandId::PositionRead => {
            if bytes.len() != 5 + count {
                return Err(ProtocolError::MalformedFrame);
            }
            let mut ids = ServoIds::new();
            for &id in &bytes[5..] {
                let _ = ids.push(ServoId::new(id)?);
            }
            if command == CommandId::Unload {
                Ok(Request::Unload(ids))
            } else {
                Ok(Request::PositionRead(ids))
            }
        }
    }
}
