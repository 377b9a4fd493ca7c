//! In-memory transports for session tests

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc as futures_mpsc;
use futures::Sink;
use parking_lot::Mutex;

use webterm_protocol::{ClientMessage, ServerMessage};
use webterm_utils::Result;

use super::{MasterFrame, MasterTransport, SessionOptions, TransportError};
use crate::slave::Slave;

/// Records every outbound frame and close call
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    pub(crate) frames: Arc<Mutex<Vec<MasterFrame>>>,
    pub(crate) closes: Arc<AtomicUsize>,
}

impl Recorder {
    pub(crate) fn messages(&self) -> Vec<ServerMessage> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                MasterFrame::Data(data) => ServerMessage::decode(data.clone()).ok(),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn output(&self) -> Vec<u8> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Output(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub(crate) fn pongs(&self) -> usize {
        self.messages()
            .iter()
            .filter(|m| matches!(m, ServerMessage::Pong))
            .count()
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub(crate) struct RecordingSink(pub(crate) Recorder);

impl Sink<MasterFrame> for RecordingSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: MasterFrame) -> std::result::Result<(), Self::Error> {
        self.0.frames.lock().push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Client that never accepts another frame
#[derive(Clone, Default)]
pub(crate) struct StalledSink {
    pub(crate) closes: Arc<AtomicUsize>,
}

impl Sink<MasterFrame> for StalledSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: MasterFrame) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Process double driven by the test
pub(crate) struct FakeSlave {
    output: Mutex<std_mpsc::Receiver<Vec<u8>>>,
    writes: Mutex<Vec<u8>>,
    stall_writes: AtomicBool,
    resizes: Mutex<Vec<(u16, u16)>>,
    closes: AtomicUsize,
    closed: AtomicBool,
}

impl FakeSlave {
    pub(crate) fn new() -> (Arc<Self>, std_mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = std_mpsc::channel();
        let slave = Arc::new(Self {
            output: Mutex::new(rx),
            writes: Mutex::new(Vec::new()),
            stall_writes: AtomicBool::new(false),
            resizes: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        (slave, tx)
    }

    /// Block every write until the process is closed
    pub(crate) fn stall_writes(&self) {
        self.stall_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn writes(&self) -> Vec<u8> {
        self.writes.lock().clone()
    }

    pub(crate) fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().clone()
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Slave for FakeSlave {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let output = self.output.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            match output.recv_timeout(Duration::from_millis(10)) {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok(n);
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.stall_writes.load(Ordering::SeqCst) {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !self.closed.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.writes.lock().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, columns: u16, rows: u16) -> Result<()> {
        self.resizes.lock().push((columns, rows));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn window_title_variables(&self) -> HashMap<String, String> {
        HashMap::from([("command".to_string(), "fake".to_string())])
    }
}

pub(crate) type Inbound = futures_mpsc::UnboundedSender<std::result::Result<Bytes, TransportError>>;

pub(crate) fn fake_master() -> (MasterTransport, Inbound, Recorder) {
    let (inbound_tx, inbound_rx) = futures_mpsc::unbounded();
    let recorder = Recorder::default();
    let transport = MasterTransport::new(inbound_rx, RecordingSink(recorder.clone()));
    (transport, inbound_tx, recorder)
}

pub(crate) fn stalled_master() -> (MasterTransport, Inbound, StalledSink) {
    let (inbound_tx, inbound_rx) = futures_mpsc::unbounded();
    let sink = StalledSink::default();
    let transport = MasterTransport::new(inbound_rx, sink.clone());
    (transport, inbound_tx, sink)
}

pub(crate) fn send(inbound: &Inbound, message: ClientMessage) {
    inbound.unbounded_send(Ok(message.encode().unwrap())).unwrap();
}

pub(crate) fn send_raw(inbound: &Inbound, frame: &'static [u8]) {
    inbound.unbounded_send(Ok(Bytes::from_static(frame))).unwrap();
}

pub(crate) fn test_options() -> SessionOptions {
    SessionOptions::default()
        .with_title("test")
        .with_keepalive(None, None)
}

pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(std::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
