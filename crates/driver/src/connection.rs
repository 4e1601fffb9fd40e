use std::{future::Future, path::Path, time::Duration};

use anyhow::Context as _;
use brazo_planner::{ServoBus, TransportError};
use brazo_protocol::Frame;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    sync::{mpsc, oneshot},
};

/// HID reports from the servo controller are never longer than this.
pub const MAX_REPORT: usize = 64;

/// A raw byte pipe to the servo controller.
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn read(&mut self, max: usize) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

/// A character device, like `/dev/hidraw0`.
pub struct DeviceTransport {
    file: File,
    report_id: Option<u8>,
}

impl DeviceTransport {
    pub async fn open(path: &Path, report_id: Option<u8>) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(DeviceTransport { file, report_id })
    }
}

impl Transport for DeviceTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut buf = Vec::with_capacity(bytes.len() + 1);
        buf.extend(self.report_id);
        buf.extend_from_slice(bytes);
        self.file.write_all(&buf).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0; max];
        let n = self.file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusConfig {
    /// How long to wait between sending a query and reading the answer.
    pub settle: Duration,
    pub read_timeout: Duration,
}

enum BusRequest {
    Send {
        frame: Frame,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    Request {
        frame: Frame,
        reply: oneshot::Sender<Result<Vec<u8>, TransportError>>,
    },
}

/// A cheap, cloneable way to put frames on the bus.
///
/// All the handles share a single task, which owns the transport and runs
/// one command at a time.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<BusRequest>,
}

pub fn spawn_bus<T: Transport + 'static>(transport: T, config: BusConfig) -> BusHandle {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(run_bus(transport, config, rx));
    BusHandle { tx }
}

async fn run_bus<T: Transport>(
    mut transport: T,
    config: BusConfig,
    mut requests: mpsc::Receiver<BusRequest>,
) {
    while let Some(req) = requests.recv().await {
        match req {
            BusRequest::Send { frame, done } => {
                let result = send_frame(&mut transport, &frame).await;
                // The caller may have stopped waiting, and that's fine.
                let _ = done.send(result);
            }
            BusRequest::Request { frame, reply } => {
                let result = request_frame(&mut transport, &config, &frame).await;
                let _ = reply.send(result);
            }
        }
    }
    log::debug!("all bus handles dropped, closing the bus");
}

async fn send_frame<T: Transport>(transport: &mut T, frame: &Frame) -> Result<(), TransportError> {
    log::debug!("writing {:02x?}", frame.as_bytes());
    transport.write(frame.as_bytes()).await?;

    // The controller doesn't tell us when a move is done, so we hold the bus
    // for as long as the move was supposed to take.
    if let Some(ms) = frame.move_duration() {
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
    }
    Ok(())
}

async fn request_frame<T: Transport>(
    transport: &mut T,
    config: &BusConfig,
    frame: &Frame,
) -> Result<Vec<u8>, TransportError> {
    log::debug!("writing {:02x?}", frame.as_bytes());
    transport.write(frame.as_bytes()).await?;
    tokio::time::sleep(config.settle).await;

    let response = tokio::time::timeout(config.read_timeout, transport.read(MAX_REPORT))
        .await
        .map_err(|_| TransportError::Timeout)??;
    log::trace!("read {response:02x?}");
    Ok(response)
}

impl ServoBus for BusHandle {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(BusRequest::Send { frame, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn request(&mut self, frame: Frame) -> Result<Vec<u8>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BusRequest::Request { frame, reply })
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use brazo_protocol::{encode_move, encode_query, encode_query_response, ServoId};
    use tokio::time::Instant;

    use super::*;

    const CONFIG: BusConfig = BusConfig {
        settle: Duration::from_millis(200),
        read_timeout: Duration::from_millis(1000),
    };

    /// Remembers when each write happened, and answers reads from a script.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        writes: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
        answers: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Transport for ScriptedTransport {
        async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.writes
                .lock()
                .unwrap()
                .push((Instant::now(), bytes.to_vec()));
            Ok(())
        }

        async fn read(&mut self, _max: usize) -> Result<Vec<u8>, TransportError> {
            let answer = self.answers.lock().unwrap().pop();
            match answer {
                Some(answer) => Ok(answer),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn moves_hold_the_bus() {
        let transport = ScriptedTransport::default();
        let mut bus = spawn_bus(transport.clone(), CONFIG);

        let start = Instant::now();
        let slow = encode_move(&[ServoId::GRIPPER], &[200], 1500).unwrap();
        let fast = encode_move(&[ServoId::GRIPPER], &[650], 10).unwrap();

        // Two handles racing for the bus still get one command at a time.
        let mut other = bus.clone();
        let (a, b) = tokio::join!(bus.send(slow.clone()), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            other.send(fast.clone()).await
        });
        a.unwrap();
        b.unwrap();

        let writes = transport.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, slow.as_bytes());
        assert_eq!(writes[1].1, fast.as_bytes());
        assert!(writes[1].0 - start >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn queries_wait_then_read() {
        let transport = ScriptedTransport::default();
        let response = encode_query_response(&[(ServoId::BASE, 123)]).unwrap();
        transport
            .answers
            .lock()
            .unwrap()
            .push(response.as_bytes().to_vec());
        let mut bus = spawn_bus(transport.clone(), CONFIG);

        let start = Instant::now();
        let answer = bus
            .request(encode_query(&[ServoId::BASE]).unwrap())
            .await
            .unwrap();
        assert_eq!(answer, response.as_bytes());
        assert!(start.elapsed() >= CONFIG.settle);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_times_out() {
        let mut bus = spawn_bus(ScriptedTransport::default(), CONFIG);
        let start = Instant::now();
        assert_eq!(
            bus.request(encode_query(&[ServoId::BASE]).unwrap()).await,
            Err(TransportError::Timeout)
        );
        assert!(start.elapsed() >= CONFIG.settle + CONFIG.read_timeout);

        // The bus is still usable afterwards.
        bus.send(encode_move(&[ServoId::BASE], &[500], 5).unwrap())
            .await
            .unwrap();
    }
}
