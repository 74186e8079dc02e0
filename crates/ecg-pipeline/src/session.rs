//! Recording session control over the device transport

use crate::frame::{FrameError, FrameReader, RawFrame};
use ecg_core::{DeviceCommand, DeviceReply, Packet};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Out-of-band signal from the acquisition boundary to the terminal consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// A recording ended after `packets` packets were emitted downstream
    SessionEnded { session: u64, packets: u64 },
}

/// Issues START/STOP/PING on the transport and numbers the packets of each recording
pub struct SessionControl<W> {
    writer: W,
    control: mpsc::UnboundedSender<ControlSignal>,
    ack_timeout: Duration,
    session: u64,
    packets: u64,
    recording: bool,
}

impl<W: AsyncWrite + Unpin> SessionControl<W> {
    pub fn new(writer: W, control: mpsc::UnboundedSender<ControlSignal>, ack_timeout: Duration) -> Self {
        SessionControl {
            writer,
            control,
            ack_timeout,
            session: 0,
            packets: 0,
            recording: false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Number of the current (or last) session; 0 before the first recording
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Packets stamped in the current session
    pub fn packets(&self) -> u64 {
        self.packets
    }

    async fn send(&mut self, command: DeviceCommand) -> Result<(), FrameError> {
        self.writer.write_all(&command.to_line()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Begin a recording and wait briefly for the device to acknowledge.
    ///
    /// Input still pending from before the command is dropped first, so
    /// the reply read is the device's answer to START. The acknowledgment
    /// is logged only. Returns the session number.
    pub async fn start<R: AsyncRead + Unpin>(&mut self, reader: &mut FrameReader<R>) -> Result<u64, FrameError> {
        if self.recording {
            debug!(session = self.session, "start ignored, already recording");
            return Ok(self.session);
        }
        reader.discard_input().await?;
        self.send(DeviceCommand::Start).await?;
        self.session += 1;
        self.packets = 0;
        self.recording = true;

        match reader.read_reply(self.ack_timeout).await {
            Ok(Some(DeviceReply::Ack)) => info!(session = self.session, "recording started"),
            Ok(reply) => warn!(session = self.session, ?reply, "recording started without acknowledgment"),
            Err(e) => warn!(session = self.session, error = %e, "failed to read start acknowledgment"),
        }
        Ok(self.session)
    }

    /// End the recording and emit `SessionEnded` exactly once.
    ///
    /// Returns the ended session, or `None` when nothing was recording.
    pub async fn stop(&mut self) -> Option<u64> {
        if !self.recording {
            return None;
        }
        self.recording = false;
        if let Err(e) = self.send(DeviceCommand::Stop).await {
            warn!(session = self.session, error = %e, "failed to send stop command");
        }

        let signal = ControlSignal::SessionEnded {
            session: self.session,
            packets: self.packets,
        };
        if self.control.send(signal).is_err() {
            debug!(session = self.session, "control channel closed, session end not delivered");
        }
        info!(session = self.session, packets = self.packets, "recording stopped");
        Some(self.session)
    }

    /// Check the device is responsive; true if PONG arrived within the ack timeout
    pub async fn ping<R: AsyncRead + Unpin>(&mut self, reader: &mut FrameReader<R>) -> Result<bool, FrameError> {
        self.send(DeviceCommand::Ping).await?;
        let reply = reader.read_reply(self.ack_timeout).await?;
        debug!(?reply, "ping reply");
        Ok(reply == Some(DeviceReply::Pong))
    }

    /// Assign the frame its place in the current session; `None` while idle
    pub fn stamp(&mut self, frame: RawFrame) -> Option<Packet> {
        if !self.recording {
            return None;
        }
        let packet = frame.into_packet(self.session, self.packets);
        self.packets += 1;
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameReaderConfig;
    use ecg_core::PAYLOAD_SIZE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame() -> RawFrame {
        RawFrame {
            payload: vec![0u8; PAYLOAD_SIZE],
        }
    }

    #[tokio::test]
    async fn test_start_stop_emits_single_signal() {
        let (host, mut device) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(host);
        let mut reader = FrameReader::new(read_half, FrameReaderConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut control = SessionControl::new(write_half, tx, Duration::from_millis(100));

        assert_eq!(control.start(&mut reader).await.unwrap(), 1);
        assert_eq!(control.start(&mut reader).await.unwrap(), 1);
        assert!(control.is_recording());

        let first = control.stamp(frame()).unwrap();
        let second = control.stamp(frame()).unwrap();
        assert_eq!((first.session, first.sequence), (1, 0));
        assert_eq!((second.session, second.sequence), (1, 1));

        assert_eq!(control.stop().await, Some(1));
        assert_eq!(control.stop().await, None);
        assert!(control.stamp(frame()).is_none());

        assert_eq!(rx.try_recv().unwrap(), ControlSignal::SessionEnded { session: 1, packets: 2 });
        assert!(rx.try_recv().is_err());

        let mut sent = vec![0u8; 11];
        device.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"START\nSTOP\n");
    }

    #[tokio::test]
    async fn test_start_without_ack_still_records() {
        let (host, _device) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(host);
        let mut reader = FrameReader::new(read_half, FrameReaderConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut control = SessionControl::new(write_half, tx, Duration::from_millis(20));

        assert_eq!(control.start(&mut reader).await.unwrap(), 1);
        assert!(control.is_recording());
        control.stop().await;
        assert_eq!(control.start(&mut reader).await.unwrap(), 2);
        assert_eq!(control.packets(), 0);
    }

    #[tokio::test]
    async fn test_start_drops_stale_frame_bytes() {
        let (host, mut device) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(host);
        let mut reader = FrameReader::new(read_half, FrameReaderConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut control = SessionControl::new(write_half, tx, Duration::from_millis(200));

        // Leftovers of an earlier recording, newline bytes included
        let mut stale = ecg_core::MARKER.to_vec();
        stale.extend((0..200u8).map(|b| b % 16));
        device.write_all(&stale).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut command = [0u8; 6];
            device.read_exact(&mut command).await.unwrap();
            assert_eq!(&command, b"START\n");
            device.write_all(b"ACK\n").await.unwrap();
            device
        });

        assert_eq!(control.start(&mut reader).await.unwrap(), 1);
        let _device = responder.await.unwrap();
        assert_eq!(reader.stats().bytes_discarded, stale.len() as u64);
        // The acknowledgment was consumed by start, nothing is left over
        assert_eq!(reader.read_reply(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ping_expects_pong() {
        let (host, mut device) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(host);
        let mut reader = FrameReader::new(read_half, FrameReaderConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut control = SessionControl::new(write_half, tx, Duration::from_millis(50));

        device.write_all(b"PONG\n").await.unwrap();
        assert!(control.ping(&mut reader).await.unwrap());
        assert!(!control.ping(&mut reader).await.unwrap());
    }
}
