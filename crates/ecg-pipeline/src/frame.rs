//! Marker-synchronized frame reader
//!
//! Turns an untrusted byte stream into payload-sized frames. The reader is
//! an explicit `Searching`/`Synced` state machine: each call to
//! [`FrameReader::next_packet`] returns at most one event and never recurses,
//! so sustained corruption costs bytes, not stack.

use ecg_core::{DeviceReply, Packet, MARKER, PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::debug;

/// Longest text reply accepted from the device
pub const MAX_REPLY_LEN: usize = 64;

/// Upper bound on bytes dropped by one [`FrameReader::discard_input`]
const MAX_DISCARD: usize = 64 * 1024;

/// Errors raised while reading frames
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("expected frame marker, found {found:02x?}")]
    MarkerMismatch { found: Vec<u8> },

    #[error("truncated payload: received {received} of {expected} bytes")]
    TruncatedPayload { received: usize, expected: usize },

    #[error("no frame marker within {scanned} bytes")]
    ResyncExhausted { scanned: usize },

    #[error("no frame data within the poll interval")]
    Stalled,

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Framing was lost and the reader is searching for the next marker
    pub fn is_desync(&self) -> bool {
        matches!(self, FrameError::MarkerMismatch { .. } | FrameError::TruncatedPayload { .. })
    }

    /// Calling `next_packet` again may succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

/// Synchronization state of the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Searching,
    Synced,
}

/// Reader tunables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReaderConfig {
    /// Bytes scanned per call while searching for a marker
    pub resync_budget: usize,
    /// How long to wait for the first byte of a frame
    pub poll_interval: Duration,
    /// How long the rest of a started frame may take to arrive
    pub frame_timeout: Duration,
}

impl Default for FrameReaderConfig {
    fn default() -> Self {
        Self {
            resync_budget: 1000,
            poll_interval: Duration::from_millis(100),
            frame_timeout: Duration::from_millis(1000),
        }
    }
}

/// Counters kept by the reader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    pub packets: u64,
    pub desync_events: u64,
    pub resyncs: u64,
    pub resync_exhausted: u64,
    /// Bytes consumed while searching for a marker
    pub bytes_skipped: u64,
    pub stalls: u64,
    /// Stale bytes dropped before a command
    pub bytes_discarded: u64,
}

/// One marker-delimited payload, not yet assigned to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn into_packet(self, session: u64, sequence: u64) -> Packet {
        Packet::new(session, sequence, self.payload)
    }
}

/// Outcome of a bounded multi-byte read
enum Fill {
    Complete,
    Short(usize),
    Eof(usize),
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    config: FrameReaderConfig,
    state: SyncState,
    /// Sliding marker window used while searching
    window: VecDeque<u8>,
    stats: FrameStats,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, config: FrameReaderConfig) -> Self {
        FrameReader {
            reader: BufReader::new(inner),
            config,
            // A fresh stream is assumed to start on a frame boundary
            state: SyncState::Synced,
            window: VecDeque::with_capacity(MARKER.len()),
            stats: FrameStats::default(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn config(&self) -> &FrameReaderConfig {
        &self.config
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` marks the end of the stream. Desync events, resync
    /// exhaustion and stalls are returned as errors the caller logs before
    /// calling again; only [`FrameError::Io`] is terminal.
    pub async fn next_packet(&mut self) -> Result<Option<RawFrame>, FrameError> {
        match self.state {
            SyncState::Synced => self.read_synced().await,
            SyncState::Searching => self.search().await,
        }
    }

    async fn read_synced(&mut self) -> Result<Option<RawFrame>, FrameError> {
        let Some(first) = self.poll_byte().await? else {
            return Ok(None);
        };

        let mut marker = [0u8; MARKER.len()];
        marker[0] = first;
        let deadline = Instant::now() + self.config.frame_timeout;
        match self.fill(&mut marker[1..], deadline).await? {
            Fill::Complete => {}
            Fill::Eof(_) => return Ok(None),
            Fill::Short(read) => {
                let found = marker[..read + 1].to_vec();
                return Err(self.lose_sync_on_marker(found));
            }
        }

        if &marker != MARKER {
            return Err(self.lose_sync_on_marker(marker.to_vec()));
        }
        self.read_payload(deadline).await.map(Some)
    }

    /// Scan byte by byte for the marker, within the resync budget
    async fn search(&mut self) -> Result<Option<RawFrame>, FrameError> {
        let mut scanned = 0;
        while scanned < self.config.resync_budget {
            let Some(byte) = self.poll_byte().await? else {
                return Ok(None);
            };
            scanned += 1;
            self.stats.bytes_skipped += 1;

            if self.window.len() == MARKER.len() {
                self.window.pop_front();
            }
            self.window.push_back(byte);

            if self.window.iter().eq(MARKER.iter()) {
                self.window.clear();
                self.state = SyncState::Synced;
                self.stats.resyncs += 1;
                debug!(scanned, "frame marker found, resynchronized");
                let deadline = Instant::now() + self.config.frame_timeout;
                return self.read_payload(deadline).await.map(Some);
            }
        }

        self.stats.resync_exhausted += 1;
        Err(FrameError::ResyncExhausted { scanned })
    }

    async fn read_payload(&mut self, deadline: Instant) -> Result<RawFrame, FrameError> {
        let mut payload = vec![0u8; PAYLOAD_SIZE];
        match self.fill(&mut payload, deadline).await? {
            Fill::Complete => {
                self.stats.packets += 1;
                Ok(RawFrame { payload })
            }
            Fill::Short(received) | Fill::Eof(received) => {
                self.state = SyncState::Searching;
                self.stats.desync_events += 1;
                let tail = received.saturating_sub(MARKER.len());
                self.seed_window(&payload[tail..received]);
                Err(FrameError::TruncatedPayload {
                    received,
                    expected: PAYLOAD_SIZE,
                })
            }
        }
    }

    fn lose_sync_on_marker(&mut self, found: Vec<u8>) -> FrameError {
        self.state = SyncState::Searching;
        self.stats.desync_events += 1;
        self.seed_window(&found);
        FrameError::MarkerMismatch { found }
    }

    /// Start the search from bytes already consumed, so a marker straddling them is found in place
    fn seed_window(&mut self, bytes: &[u8]) {
        self.window.clear();
        let start = bytes.len().saturating_sub(MARKER.len());
        self.window.extend(&bytes[start..]);
    }

    /// One byte within the poll interval; `None` at end of stream
    async fn poll_byte(&mut self) -> Result<Option<u8>, FrameError> {
        match timeout(self.config.poll_interval, self.reader.read_u8()).await {
            Err(_) => {
                self.stats.stalls += 1;
                Err(FrameError::Stalled)
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(byte)) => Ok(Some(byte)),
        }
    }

    async fn fill(&mut self, buf: &mut [u8], deadline: Instant) -> Result<Fill, FrameError> {
        let mut filled = 0;
        while filled < buf.len() {
            match timeout_at(deadline, self.reader.read(&mut buf[filled..])).await {
                Err(_) => return Ok(Fill::Short(filled)),
                Ok(Ok(0)) => return Ok(Fill::Eof(filled)),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(Fill::Complete)
    }

    /// Drop everything already received from the device.
    ///
    /// Clears the read buffer and whatever the transport has ready, without
    /// waiting for more. The next byte read is taken to start a frame or a
    /// reply line. Returns the number of bytes dropped.
    pub async fn discard_input(&mut self) -> Result<usize, FrameError> {
        let mut discarded = self.reader.buffer().len();
        self.reader.consume(discarded);

        let mut scratch = [0u8; 512];
        while discarded < MAX_DISCARD {
            match timeout(Duration::ZERO, self.reader.read(&mut scratch)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        self.window.clear();
        self.state = SyncState::Synced;
        self.stats.bytes_discarded += discarded as u64;
        if discarded > 0 {
            debug!(discarded, "stale input dropped");
        }
        Ok(discarded)
    }

    /// Read one text line from the device, up to `MAX_REPLY_LEN` bytes.
    ///
    /// Returns `None` if no complete line arrives before `wait` elapses or the stream ends.
    pub async fn read_reply(&mut self, wait: Duration) -> Result<Option<DeviceReply>, FrameError> {
        let deadline = Instant::now() + wait;
        let mut line = Vec::with_capacity(MAX_REPLY_LEN);
        loop {
            let byte = match timeout_at(deadline, self.reader.read_u8()).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(byte)) => byte,
            };
            match byte {
                b'\n' if line.is_empty() => continue,
                b'\n' => break,
                _ => line.push(byte),
            }
            if line.len() >= MAX_REPLY_LEN {
                break;
            }
        }
        let text = String::from_utf8_lossy(&line);
        Ok(Some(DeviceReply::parse(&text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecg_core::{decode_samples, Sample, SAMPLES_PER_PACKET};
    use tokio::io::AsyncWriteExt;

    fn frame(first_timestamp: u32) -> Vec<u8> {
        let samples: Vec<Sample> = (0..SAMPLES_PER_PACKET as u32)
            .map(|i| Sample::new(first_timestamp + i * 3, (i % 4096) as u16))
            .collect();
        Packet::from_samples(0, 0, &samples).unwrap().encode_frame()
    }

    fn reader(bytes: &[u8]) -> FrameReader<&[u8]> {
        FrameReader::new(bytes, FrameReaderConfig::default())
    }

    #[tokio::test]
    async fn test_reads_consecutive_frames() {
        let mut stream = frame(0);
        stream.extend(frame(768));
        let mut reader = reader(&stream);

        let first = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(decode_samples(&first.payload)[0].timestamp_ms, 0);
        let second = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(decode_samples(&second.payload)[0].timestamp_ms, 768);
        assert!(reader.next_packet().await.unwrap().is_none());
        assert_eq!(reader.stats().packets, 2);
        assert_eq!(reader.stats().desync_events, 0);
    }

    #[tokio::test]
    async fn test_resyncs_at_marker_after_garbage() {
        let garbage: Vec<u8> = (0..100u8).map(|b| b.wrapping_mul(7) | 0x80).collect();
        let mut stream = garbage.clone();
        stream.extend(frame(42));
        let mut reader = reader(&stream);

        let err = reader.next_packet().await.unwrap_err();
        assert!(matches!(err, FrameError::MarkerMismatch { ref found } if found.len() == 6));
        assert!(err.is_desync());
        assert_eq!(reader.state(), SyncState::Searching);

        let frame = reader.next_packet().await.unwrap().unwrap();
        let samples = decode_samples(&frame.payload);
        assert_eq!(samples.len(), SAMPLES_PER_PACKET);
        assert_eq!(samples[0].timestamp_ms, 42);
        assert_eq!(reader.state(), SyncState::Synced);
        assert_eq!(reader.stats().resyncs, 1);
        // 94 garbage bytes after the seeded six, then the marker
        assert_eq!(reader.stats().bytes_skipped, 94 + MARKER.len() as u64);
    }

    #[tokio::test]
    async fn test_marker_straddling_failed_read_is_found() {
        let mut stream = b"xy".to_vec();
        stream.extend(frame(9));
        let mut reader = reader(&stream);

        let err = reader.next_packet().await.unwrap_err();
        match err {
            FrameError::MarkerMismatch { found } => assert_eq!(found, b"xyMARK".to_vec()),
            other => panic!("unexpected {:?}", other),
        }
        let frame = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(decode_samples(&frame.payload)[0].timestamp_ms, 9);
    }

    #[tokio::test]
    async fn test_resync_budget_exhausted() {
        let mut stream = vec![b'#'; 2500];
        stream.extend(frame(0));
        let mut reader = reader(&stream);

        assert!(reader.next_packet().await.unwrap_err().is_desync());
        let err = reader.next_packet().await.unwrap_err();
        assert!(matches!(err, FrameError::ResyncExhausted { scanned: 1000 }));
        assert!(err.is_recoverable());
        let err = reader.next_packet().await.unwrap_err();
        assert!(matches!(err, FrameError::ResyncExhausted { .. }));

        // Budget renews per call; the frame is eventually recovered intact
        let frame = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(frame.payload.len(), PAYLOAD_SIZE);
        assert_eq!(reader.stats().resync_exhausted, 2);
    }

    #[tokio::test]
    async fn test_truncated_payload_then_end_of_stream() {
        let full = frame(0);
        let stream = &full[..MARKER.len() + 600];
        let mut reader = reader(stream);

        let err = reader.next_packet().await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedPayload { received: 600, expected: PAYLOAD_SIZE }
        ));
        assert!(reader.next_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_stream_reports_stall() {
        let (host, mut device) = tokio::io::duplex(4096);
        let config = FrameReaderConfig {
            poll_interval: Duration::from_millis(20),
            frame_timeout: Duration::from_millis(50),
            ..FrameReaderConfig::default()
        };
        let mut reader = FrameReader::new(host, config);

        assert!(matches!(reader.next_packet().await, Err(FrameError::Stalled)));
        assert_eq!(reader.state(), SyncState::Synced);

        // A frame that stops halfway counts as truncation
        device.write_all(&frame(0)[..100]).await.unwrap();
        let err = reader.next_packet().await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedPayload { received: 94, .. }));
        assert_eq!(reader.stats().stalls, 1);
    }

    #[tokio::test]
    async fn test_discard_input_drops_stale_bytes() {
        let (host, mut device) = tokio::io::duplex(4096);
        let config = FrameReaderConfig {
            poll_interval: Duration::from_millis(20),
            frame_timeout: Duration::from_millis(20),
            ..FrameReaderConfig::default()
        };
        let mut reader = FrameReader::new(host, config);
        let stale = frame(0);

        device.write_all(&stale[..300]).await.unwrap();
        assert!(reader.next_packet().await.unwrap_err().is_desync());
        assert_eq!(reader.state(), SyncState::Searching);

        device.write_all(&stale[300..600]).await.unwrap();
        assert_eq!(reader.discard_input().await.unwrap(), 300);
        assert_eq!(reader.state(), SyncState::Synced);
        assert_eq!(reader.stats().bytes_discarded, 300);

        device.write_all(b"ACK\n").await.unwrap();
        device.write_all(&frame(0)).await.unwrap();
        let wait = Duration::from_millis(50);
        assert_eq!(reader.read_reply(wait).await.unwrap(), Some(DeviceReply::Ack));
        assert!(reader.next_packet().await.unwrap().is_some());
        assert_eq!(reader.discard_input().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_reply_lines() {
        let mut stream = b"\nACK\nPONG\n".to_vec();
        stream.extend(frame(0));
        let mut reader = reader(&stream);

        let wait = Duration::from_millis(50);
        assert_eq!(reader.read_reply(wait).await.unwrap(), Some(DeviceReply::Ack));
        assert_eq!(reader.read_reply(wait).await.unwrap(), Some(DeviceReply::Pong));
        assert!(reader.next_packet().await.unwrap().is_some());
        assert_eq!(reader.read_reply(wait).await.unwrap(), None);
    }
}
