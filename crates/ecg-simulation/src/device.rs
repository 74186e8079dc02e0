//! Simulated acquisition device speaking the framed wire protocol

use crate::ecg_simulator::{EcgConfig, EcgSimulator};
use ecg_core::{DeviceCommand, DeviceReply, EcgResult, Packet, MARKER, SAMPLES_PER_PACKET};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// How fast recorded packets are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pacing {
    /// One packet per `256 / sample_rate` seconds, as the hardware does
    RealTime,
    /// As fast as the transport accepts them
    Unpaced,
}

/// Configuration for the simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub ecg: EcgConfig,
    pub pacing: Pacing,
    /// Packets per recording before the device goes quiet
    pub max_packets: Option<u64>,
    /// Close the transport once `max_packets` have been written
    pub hang_up_when_done: bool,
    /// Write garbage before every n-th packet
    pub garbage_every: Option<u64>,
    pub garbage_len: usize,
    /// Transport buffer size in bytes
    pub buffer_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ecg: EcgConfig::default(),
            pacing: Pacing::RealTime,
            max_packets: None,
            hang_up_when_done: false,
            garbage_every: None,
            garbage_len: 37,
            buffer_size: 64 * 1024,
        }
    }
}

/// Counters reported when the device task ends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub recordings: u64,
    pub packets_sent: u64,
    pub garbage_bytes: u64,
    pub partial_flushes: u64,
    pub commands: u64,
}

/// Stand-in for the acquisition firmware
pub struct SimulatedDevice {
    config: DeviceConfig,
    simulator: EcgSimulator,
    rng: StdRng,
    booted: Instant,
    stats: DeviceStats,
    recording: bool,
    session_packets: u64,
    packet_started: Instant,
}

impl SimulatedDevice {
    pub fn new(config: DeviceConfig) -> EcgResult<Self> {
        let simulator = EcgSimulator::new(config.ecg.clone())?;
        let rng = StdRng::seed_from_u64(config.ecg.seed.unwrap_or(0) ^ 0x5eed);
        let now = Instant::now();
        Ok(SimulatedDevice {
            config,
            simulator,
            rng,
            booted: now,
            stats: DeviceStats::default(),
            recording: false,
            session_packets: 0,
            packet_started: now,
        })
    }

    /// Spawn the device on one end of an in-memory duplex stream and return the host end
    pub fn spawn(self) -> (DuplexStream, JoinHandle<io::Result<DeviceStats>>) {
        let (host, device) = tokio::io::duplex(self.config.buffer_size);
        let handle = tokio::spawn(self.run(device));
        (host, handle)
    }

    fn packet_period(&self) -> Duration {
        Duration::from_secs_f64(SAMPLES_PER_PACKET as f64 / self.config.ecg.sample_rate)
    }

    fn device_clock_ms(&self) -> u32 {
        self.booted.elapsed().as_millis() as u32
    }

    /// Serve commands and stream packets until the host hangs up
    pub async fn run(mut self, stream: DuplexStream) -> io::Result<DeviceStats> {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        writer.write_all(&DeviceReply::Ready.to_line()).await?;
        writer.flush().await?;
        info!("simulated device ready");

        let period = self.packet_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let realtime = self.config.pacing == Pacing::RealTime;

        loop {
            tokio::select! {
                biased;

                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("host closed the transport");
                        break;
                    };
                    self.handle_command(&line, &mut writer).await?;
                    if self.recording && realtime && self.session_packets == 0 {
                        ticker.reset();
                    }
                }

                _ = ticker.tick(), if self.recording && realtime => {
                    if !self.write_packet(&mut writer).await? {
                        break;
                    }
                }

                _ = tokio::task::yield_now(), if self.recording && !realtime => {
                    if !self.write_packet(&mut writer).await? {
                        break;
                    }
                }
            }
        }

        writer.shutdown().await.ok();
        info!(packets = self.stats.packets_sent, "simulated device stopped");
        Ok(self.stats)
    }

    async fn handle_command<W: AsyncWrite + Unpin>(&mut self, line: &str, writer: &mut W) -> io::Result<()> {
        self.stats.commands += 1;
        match DeviceCommand::parse(line) {
            Some(DeviceCommand::Start) => {
                writer.write_all(&DeviceReply::Ack.to_line()).await?;
                if !self.recording {
                    self.recording = true;
                    self.session_packets = 0;
                    self.stats.recordings += 1;
                    self.simulator.restart(self.device_clock_ms());
                    self.packet_started = Instant::now();
                    info!(recording = self.stats.recordings, "device recording started");
                }
            }
            Some(DeviceCommand::Stop) => {
                writer.write_all(&DeviceReply::Ack.to_line()).await?;
                if self.recording {
                    self.recording = false;
                    if self.config.pacing == Pacing::RealTime {
                        self.flush_partial(writer).await?;
                    }
                    info!(packets = self.session_packets, "device recording stopped");
                }
            }
            Some(DeviceCommand::Ping) => {
                writer.write_all(&DeviceReply::Pong.to_line()).await?;
            }
            None => debug!(line, "ignoring unknown command"),
        }
        writer.flush().await
    }

    /// Write the next packet; returns false once the device should hang up
    async fn write_packet<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<bool> {
        if let Some(every) = self.config.garbage_every {
            if every > 0 && self.session_packets > 0 && self.session_packets % every == 0 {
                let garbage = self.garbage();
                writer.write_all(&garbage).await?;
                self.stats.garbage_bytes += garbage.len() as u64;
            }
        }

        let packet = self
            .simulator
            .next_packet(self.stats.recordings, self.session_packets)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        writer.write_all(&packet.encode_frame()).await?;
        writer.flush().await?;
        self.packet_started = Instant::now();
        self.session_packets += 1;
        self.stats.packets_sent += 1;

        if let Some(max) = self.config.max_packets {
            if self.session_packets >= max {
                self.recording = false;
                info!(packets = self.session_packets, "device reached its packet limit");
                return Ok(!self.config.hang_up_when_done);
            }
        }
        Ok(true)
    }

    /// Samples taken since the last full packet go out as a short frame
    async fn flush_partial<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        let elapsed = self.packet_started.elapsed().as_secs_f64();
        let pending = ((elapsed * self.config.ecg.sample_rate) as usize).min(SAMPLES_PER_PACKET - 1);
        if pending == 0 {
            return Ok(());
        }
        let samples = self.simulator.generate(pending);
        let payload = ecg_core::encode_samples(&samples);
        let frame = Packet::new(self.stats.recordings, self.session_packets, payload).encode_frame();
        writer.write_all(&frame).await?;
        self.stats.partial_flushes += 1;
        debug!(samples = pending, "flushed partial frame");
        Ok(())
    }

    /// Random bytes that cannot complete a marker
    fn garbage(&mut self) -> Vec<u8> {
        (0..self.config.garbage_len)
            .map(|_| {
                let byte: u8 = self.rng.gen();
                if byte == MARKER[0] {
                    b'#'
                } else {
                    byte
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal_patterns::SignalPattern;
    use crate::NoiseConfig;
    use ecg_core::{decode_samples, FRAME_SIZE};
    use tokio::io::AsyncReadExt;

    fn unpaced(max_packets: u64) -> DeviceConfig {
        DeviceConfig {
            ecg: EcgConfig {
                pattern: SignalPattern::Flat,
                noise: NoiseConfig::silent(),
                powerline: None,
                seed: Some(1),
                ..EcgConfig::default()
            },
            pacing: Pacing::Unpaced,
            max_packets: Some(max_packets),
            hang_up_when_done: true,
            ..DeviceConfig::default()
        }
    }

    async fn read_line<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> String {
        let mut line = Vec::new();
        loop {
            let byte = reader.read_u8().await.unwrap();
            if byte == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte);
        }
    }

    #[tokio::test]
    async fn test_device_handshake_and_stream() {
        let device = SimulatedDevice::new(unpaced(3)).unwrap();
        let (mut host, handle) = device.spawn();

        assert_eq!(read_line(&mut host).await, "READY");
        host.write_all(b"PING\n").await.unwrap();
        assert_eq!(read_line(&mut host).await, "PONG");
        host.write_all(b"START\n").await.unwrap();
        assert_eq!(read_line(&mut host).await, "ACK");

        let mut rest = Vec::new();
        host.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 3 * FRAME_SIZE);
        for frame in rest.chunks(FRAME_SIZE) {
            assert_eq!(&frame[..MARKER.len()], MARKER);
            assert_eq!(decode_samples(&frame[MARKER.len()..]).len(), SAMPLES_PER_PACKET);
        }

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.recordings, 1);
    }

    #[tokio::test]
    async fn test_garbage_injected_between_frames() {
        let config = DeviceConfig {
            garbage_every: Some(2),
            garbage_len: 10,
            ..unpaced(4)
        };
        let (mut host, handle) = SimulatedDevice::new(config).unwrap().spawn();
        assert_eq!(read_line(&mut host).await, "READY");
        host.write_all(b"start\n").await.unwrap();
        assert_eq!(read_line(&mut host).await, "ACK");

        let mut rest = Vec::new();
        host.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 4 * FRAME_SIZE + 10);
        assert!(!rest[2 * FRAME_SIZE..2 * FRAME_SIZE + 10].contains(&MARKER[0]));
        assert_eq!(handle.await.unwrap().unwrap().garbage_bytes, 10);
    }

    #[tokio::test]
    async fn test_realtime_stop_flushes_partial_frame() {
        let config = DeviceConfig {
            pacing: Pacing::RealTime,
            max_packets: None,
            hang_up_when_done: false,
            ..unpaced(0)
        };
        let (mut host, handle) = SimulatedDevice::new(config).unwrap().spawn();
        assert_eq!(read_line(&mut host).await, "READY");
        host.write_all(b"START\n").await.unwrap();
        assert_eq!(read_line(&mut host).await, "ACK");

        tokio::time::sleep(Duration::from_millis(150)).await;
        host.write_all(b"STOP\n").await.unwrap();
        assert_eq!(read_line(&mut host).await, "ACK");

        let mut marker = [0u8; 6];
        host.read_exact(&mut marker).await.unwrap();
        assert_eq!(&marker, MARKER);
        drop(host);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.partial_flushes, 1);
    }
}
