use std::collections::BTreeMap;

use brazo_planner::TransportError;
use brazo_protocol::{decode_request, encode_query_response, Request, ServoId};

use crate::connection::Transport;

/// An arm that exists only in memory. Moves land instantly, and queries
/// report wherever the last move left things.
pub struct SimulatedBus {
    positions: BTreeMap<ServoId, u16>,
    powered: bool,
    pending: Option<Vec<u8>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        SimulatedBus {
            positions: ServoId::ALL.into_iter().map(|id| (id, 500)).collect(),
            powered: true,
            pending: None,
        }
    }
}

impl SimulatedBus {
    pub fn position(&self, id: ServoId) -> u16 {
        self.positions.get(&id).copied().unwrap_or_default()
    }

    #[cfg(test)]
    fn powered(&self) -> bool {
        self.powered
    }

    fn handle(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let request = decode_request(bytes)
            .map_err(|e| TransportError::Io(format!("simulated controller rejected frame: {e}")))?;
        match request {
            Request::Move {
                duration_ms,
                targets,
            } => {
                log::info!("simulated move over {duration_ms} ms: {targets:?}");
                self.positions.extend(targets);
                self.powered = true;
            }
            Request::Unload(ids) => {
                log::info!("simulated unload of {ids:?}");
                self.powered = false;
            }
            Request::PositionRead(ids) => {
                if !self.powered {
                    log::debug!("reading positions from unpowered servos");
                }
                let answer: Vec<_> = ids.iter().map(|id| (*id, self.position(*id))).collect();
                let frame = encode_query_response(&answer)
                    .map_err(|e| TransportError::Io(e.to_string()))?;
                self.pending = Some(frame.as_bytes().to_vec());
            }
        }
        Ok(())
    }
}

impl Transport for SimulatedBus {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.handle(bytes)
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        match self.pending.take() {
            Some(mut answer) => {
                // Pad it out like a HID report.
                answer.resize(max.max(answer.len()), 0);
                Ok(answer)
            }
            // A real controller with nothing to say just stays quiet.
            None => std::future::pending().await,
        }
    }
}
