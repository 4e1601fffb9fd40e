use brazo_protocol::Frame;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("timed out waiting for the servo controller")]
    Timeout,
    #[error("the bus was closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Something that can carry frames to the servo controller.
///
/// There's only one bus, and it can only carry one command at a time:
/// implementations are expected to return only once the command has
/// finished (for a move, once the servos have had time to get there).
#[allow(async_fn_in_trait)]
pub trait ServoBus {
    /// Sends a command that doesn't expect an answer.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Sends a command and returns the controller's raw answer.
    async fn request(&mut self, frame: Frame) -> Result<Vec<u8>, TransportError>;
}
