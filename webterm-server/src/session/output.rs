//! Process output relay
//!
//! Reads the process in a blocking task (one `spawn_blocking` per read) and
//! forwards output to the client writer in bounded `Output` frames. While
//! the client is slow, output accumulates in a bounded backlog; when the
//! backlog overflows, the oldest bytes are discarded and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use webterm_protocol::{encode_frame, PayloadEncoding, ServerTag};

use super::options::MIN_OUTPUT_CHUNK;
use super::transport::MasterFrame;
use super::CloseReason;
use crate::slave::Slave;

/// Read buffer size for process reads
const READ_BUFFER_SIZE: usize = 4096;

/// Byte counters shared between a session and its relay
#[derive(Debug, Default)]
pub struct OutputCounters {
    /// Bytes forwarded to the client
    pub forwarded: AtomicU64,
    /// Bytes discarded because the client fell behind
    pub dropped: AtomicU64,
}

impl OutputCounters {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Result of a process read
#[derive(Debug)]
enum ReadResult {
    Data(Vec<u8>),
    Eof,
    Error(String),
}

pub(crate) struct OutputRelay {
    session_id: Uuid,
    slave: Arc<dyn Slave>,
    output_tx: mpsc::Sender<MasterFrame>,
    encoding: watch::Receiver<PayloadEncoding>,
    counters: Arc<OutputCounters>,
    max_chunk: usize,
    backlog_limit: usize,
    /// Time allowed to flush output left over at process exit
    flush_timeout: Duration,
    /// Unsent output, split where the encoding changed
    pending: VecDeque<(PayloadEncoding, BytesMut)>,
    pending_len: usize,
    token: CancellationToken,
}

impl OutputRelay {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: Uuid,
        slave: Arc<dyn Slave>,
        output_tx: mpsc::Sender<MasterFrame>,
        encoding: watch::Receiver<PayloadEncoding>,
        counters: Arc<OutputCounters>,
        max_chunk: usize,
        backlog_limit: usize,
        flush_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            slave,
            output_tx,
            encoding,
            counters,
            max_chunk: max_chunk.max(MIN_OUTPUT_CHUNK),
            backlog_limit: backlog_limit.max(max_chunk),
            flush_timeout,
            pending: VecDeque::new(),
            pending_len: 0,
            token,
        }
    }

    /// Relay until the process ends and its output is flushed
    ///
    /// Output still unsent `flush_timeout` after the process ended is
    /// discarded, so a client that stopped reading cannot hold the session open.
    pub(crate) async fn run(mut self) -> CloseReason {
        let (data_tx, mut data_rx) = mpsc::channel::<ReadResult>(16);

        let reader = Arc::clone(&self.slave);
        let reader_cancel = self.token.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            blocking_reader_task(reader, data_tx, reader_cancel, session_id).await;
        });

        let mut eof = false;
        let mut flush_deadline: Option<Instant> = None;
        loop {
            if eof && self.pending.is_empty() {
                debug!(session_id = %self.session_id, "Process output drained");
                return CloseReason::SlaveClosed;
            }
            if eof && flush_deadline.is_none() {
                flush_deadline = Some(Instant::now() + self.flush_timeout);
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => return CloseReason::Cancelled,

                _ = tokio::time::sleep_until(flush_deadline.unwrap_or_else(Instant::now)), if flush_deadline.is_some() => {
                    self.abandon_pending();
                    return CloseReason::SlaveClosed;
                }

                permit = self.output_tx.clone().reserve_owned(), if !self.pending.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            permit.send(self.next_frame());
                        }
                        Err(_) => return CloseReason::MasterClosed,
                    }
                }

                result = data_rx.recv(), if !eof => {
                    match result {
                        Some(ReadResult::Data(data)) => self.push(&data),
                        Some(ReadResult::Eof) | None => {
                            debug!(session_id = %self.session_id, "Process EOF");
                            eof = true;
                        }
                        Some(ReadResult::Error(e)) => {
                            debug!(session_id = %self.session_id, error = %e, "Process read error");
                            eof = true;
                        }
                    }
                }
            }
        }
    }

    /// Buffer output under the encoding in effect now
    fn push(&mut self, data: &[u8]) {
        let encoding = *self.encoding.borrow();
        match self.pending.back_mut() {
            Some((current, buf)) if *current == encoding => buf.extend_from_slice(data),
            _ => self.pending.push_back((encoding, BytesMut::from(data))),
        }
        self.pending_len += data.len();

        if self.pending_len > self.backlog_limit {
            self.discard_oldest(self.pending_len - self.backlog_limit);
        }
    }

    /// Drop everything still buffered after the process ended
    fn abandon_pending(&mut self) {
        let discarded = self.pending_len;
        self.pending.clear();
        self.pending_len = 0;
        self.counters
            .dropped
            .fetch_add(discarded as u64, Ordering::Relaxed);
        warn!(
            session_id = %self.session_id,
            discarded,
            "Client did not read remaining output after process exit"
        );
    }

    fn discard_oldest(&mut self, mut excess: usize) {
        let first_overflow = self.counters.dropped() == 0;
        let discarded = excess;

        while excess > 0 {
            let Some((_, front)) = self.pending.front_mut() else {
                break;
            };
            if front.len() <= excess {
                excess -= front.len();
                self.pending_len -= front.len();
                self.pending.pop_front();
            } else {
                front.advance(excess);
                self.pending_len -= excess;
                excess = 0;
            }
        }

        self.counters
            .dropped
            .fetch_add(discarded as u64, Ordering::Relaxed);
        if first_overflow {
            warn!(
                session_id = %self.session_id,
                discarded,
                backlog = self.backlog_limit,
                "Client is not keeping up, discarding oldest output"
            );
        } else {
            trace!(session_id = %self.session_id, discarded, "Discarded output");
        }
    }

    /// Take up to one chunk from the front of the backlog
    fn next_frame(&mut self) -> MasterFrame {
        let Some((encoding, front)) = self.pending.front_mut() else {
            return MasterFrame::Data(encode_frame(ServerTag::Output.as_byte(), &[]));
        };
        let encoding = *encoding;

        // Base64 grows 3 bytes into 4; keep the encoded payload within the bound
        let limit = match encoding {
            PayloadEncoding::Null => self.max_chunk,
            PayloadEncoding::Base64 => self.max_chunk / 4 * 3,
        };
        let raw = front.split_to(front.len().min(limit));
        if front.is_empty() {
            self.pending.pop_front();
        }
        self.pending_len -= raw.len();
        self.counters
            .forwarded
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        let payload = encoding.encode(&raw);
        MasterFrame::Data(encode_frame(ServerTag::Output.as_byte(), &payload))
    }
}

/// Blocking reader task that runs in spawn_blocking
///
/// Exits at EOF, on error, or once the relay has gone away. A read that is
/// blocked when the session is cancelled returns when the process is closed.
async fn blocking_reader_task(
    slave: Arc<dyn Slave>,
    data_tx: mpsc::Sender<ReadResult>,
    cancel_token: CancellationToken,
    session_id: Uuid,
) {
    loop {
        if cancel_token.is_cancelled() {
            trace!(session_id = %session_id, "Blocking reader cancelled");
            break;
        }

        let slave = Arc::clone(&slave);
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            match slave.read(&mut buf) {
                Ok(0) => ReadResult::Eof,
                Ok(n) => ReadResult::Data(buf[..n].to_vec()),
                Err(e)
                    if e.kind() == std::io::ErrorKind::BrokenPipe
                        || e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    ReadResult::Eof
                }
                Err(e) => ReadResult::Error(e.to_string()),
            }
        })
        .await;

        match result {
            Ok(read_result) => {
                let is_terminal = matches!(read_result, ReadResult::Eof | ReadResult::Error(_));
                if data_tx.send(read_result).await.is_err() {
                    trace!(session_id = %session_id, "Data channel closed, reader exiting");
                    break;
                }
                if is_terminal {
                    break;
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "spawn_blocking failed");
                let _ = data_tx.send(ReadResult::Error(e.to_string())).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use webterm_protocol::ServerMessage;
    use webterm_utils::Result;

    /// Slave that replays fixed chunks, then reports EOF
    struct ScriptedSlave {
        chunks: Mutex<VecDeque<Vec<u8>>>,
    }

    impl ScriptedSlave {
        fn new(chunks: &[&[u8]]) -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(chunks.iter().map(|c| c.to_vec()).collect()),
            })
        }
    }

    impl Slave for ScriptedSlave {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.lock().pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
        fn write(&self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn resize(&self, _columns: u16, _rows: u16) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
        fn window_title_variables(&self) -> HashMap<String, String> {
            HashMap::new()
        }
    }

    fn make_relay(
        slave: Arc<dyn Slave>,
        capacity: usize,
        max_chunk: usize,
        backlog: usize,
    ) -> (
        OutputRelay,
        mpsc::Receiver<MasterFrame>,
        watch::Sender<PayloadEncoding>,
        Arc<OutputCounters>,
    ) {
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (encoding_tx, encoding_rx) = watch::channel(PayloadEncoding::Null);
        let counters = Arc::new(OutputCounters::default());
        let relay = OutputRelay::new(
            Uuid::new_v4(),
            slave,
            output_tx,
            encoding_rx,
            Arc::clone(&counters),
            max_chunk,
            backlog,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        (relay, output_rx, encoding_tx, counters)
    }

    fn output_payload(frame: MasterFrame) -> Bytes {
        match frame {
            MasterFrame::Data(data) => match ServerMessage::decode(data).unwrap() {
                ServerMessage::Output(payload) => payload,
                other => panic!("expected Output, got {:?}", other),
            },
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_in_order_then_closes() {
        let slave = ScriptedSlave::new(&[b"hello ", b"world", b"\r\n"]);
        let (relay, mut rx, _enc, counters) = make_relay(slave, 64, 1024, 4096);

        let reason = tokio::time::timeout(Duration::from_secs(5), relay.run())
            .await
            .unwrap();
        assert!(matches!(reason, CloseReason::SlaveClosed));

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            received.extend_from_slice(&output_payload(frame));
        }
        assert_eq!(received, b"hello world\r\n");
        assert_eq!(counters.forwarded(), 13);
        assert_eq!(counters.dropped(), 0);
    }

    #[tokio::test]
    async fn test_relay_bounds_chunk_size() {
        let data = vec![b'x'; 100];
        let slave = ScriptedSlave::new(&[&data]);
        let (relay, mut rx, _enc, counters) = make_relay(slave, 64, 16, 4096);

        relay.run().await;

        let mut total = 0;
        while let Ok(frame) = rx.try_recv() {
            let payload = output_payload(frame);
            assert!(payload.len() <= 16);
            total += payload.len();
        }
        assert_eq!(total, 100);
        assert_eq!(counters.forwarded(), 100);
    }

    #[tokio::test]
    async fn test_relay_discards_oldest_when_client_stalls() {
        let slave = ScriptedSlave::new(&[b"aaaa", b"bbbb", b"cccc", b"dddd"]);
        // Channel holds one frame; nobody reads until the process is done
        let (relay, mut rx, _enc, counters) = make_relay(slave, 1, 4, 8);
        let handle = tokio::spawn(relay.run());

        // Let the relay read everything while the client is stalled
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut received = Vec::new();
        while let Some(frame) = rx.recv().await {
            received.extend_from_slice(&output_payload(frame));
        }
        assert!(matches!(handle.await.unwrap(), CloseReason::SlaveClosed));

        // Newest bytes always survive, totals add up
        assert!(received.ends_with(b"dddd"));
        assert_eq!(
            counters.forwarded() + counters.dropped(),
            16,
            "forwarded {} dropped {}",
            counters.forwarded(),
            counters.dropped()
        );
        assert!(counters.dropped() > 0);
        assert_eq!(received.len() as u64, counters.forwarded());
    }

    #[tokio::test]
    async fn test_exit_with_unread_output_gives_up_after_flush_timeout() {
        let data = vec![b'x'; 1024];
        let slave = ScriptedSlave::new(&[&data]);
        let (mut relay, _rx, _enc, counters) = make_relay(slave, 1, 16, 4096);
        relay.flush_timeout = Duration::from_millis(50);

        // Nobody reads, so the channel fills after one frame
        let reason = tokio::time::timeout(Duration::from_secs(5), relay.run())
            .await
            .expect("relay kept waiting for a client that stopped reading");
        assert!(matches!(reason, CloseReason::SlaveClosed));
        assert_eq!(counters.forwarded(), 16);
        assert_eq!(counters.dropped(), 1024 - 16);
    }

    #[tokio::test]
    async fn test_base64_chunks_fit_smallest_bound() {
        let slave = ScriptedSlave::new(&[]);
        let (mut relay, _rx, encoding_tx, _counters) = make_relay(slave, 8, MIN_OUTPUT_CHUNK, 4096);
        encoding_tx.send_replace(PayloadEncoding::Base64);
        relay.push(b"abcdefgh");

        while !relay.pending.is_empty() {
            assert!(output_payload(relay.next_frame()).len() <= MIN_OUTPUT_CHUNK);
        }
    }

    #[tokio::test]
    async fn test_encoding_applies_to_new_output_only() {
        let slave = ScriptedSlave::new(&[]);
        let (mut relay, _rx, encoding_tx, _counters) = make_relay(slave, 8, 1024, 4096);

        relay.push(b"raw");
        encoding_tx.send_replace(PayloadEncoding::Base64);
        relay.push(b"ls\n");

        assert_eq!(output_payload(relay.next_frame()), Bytes::from_static(b"raw"));
        assert_eq!(output_payload(relay.next_frame()), Bytes::from_static(b"bHMK"));
        assert!(relay.pending.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_relay() {
        struct BlockingSlave;
        impl Slave for BlockingSlave {
            fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
                std::thread::sleep(Duration::from_millis(20));
                Ok(0)
            }
            fn write(&self, _data: &[u8]) -> io::Result<()> {
                Ok(())
            }
            fn resize(&self, _columns: u16, _rows: u16) -> Result<()> {
                Ok(())
            }
            fn close(&self) -> Result<()> {
                Ok(())
            }
            fn window_title_variables(&self) -> HashMap<String, String> {
                HashMap::new()
            }
        }

        let (relay, _rx, _enc, _counters) = make_relay(Arc::new(BlockingSlave), 8, 1024, 4096);
        let token = relay.token.clone();
        token.cancel();
        assert!(matches!(relay.run().await, CloseReason::Cancelled));
    }
}
