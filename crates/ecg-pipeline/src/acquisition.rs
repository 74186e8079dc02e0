//! Acquisition stage: device transport in, stamped packets out

use crate::fabric::{send_with_backpressure, Delivery, FabricTiming, StageStats};
use crate::frame::{FrameError, FrameReader, FrameStats};
use crate::session::SessionControl;
use ecg_core::{DeviceReply, EcgError, EcgResult, Packet};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STAGE: &str = "acquisition";

/// Requests from the pipeline handle
#[derive(Debug)]
pub enum AcquisitionCommand {
    /// Reply with the recording session number
    Start(oneshot::Sender<EcgResult<u64>>),
    /// Reply with the ended session, if one was recording
    Stop(oneshot::Sender<Option<u64>>),
    /// Reply with whether the device is now recording
    Toggle(oneshot::Sender<EcgResult<bool>>),
    Ping(oneshot::Sender<EcgResult<bool>>),
}

/// Counters reported when acquisition exits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    pub frames: FrameStats,
    pub queue: StageStats,
    pub sessions: u64,
    /// Frames read while no session was recording
    pub idle_frames: u64,
}

pub struct AcquisitionStage<R, W> {
    reader: FrameReader<R>,
    control: SessionControl<W>,
    commands: mpsc::Receiver<AcquisitionCommand>,
    packets: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    timing: FabricTiming,
    boot_wait: Duration,
    report: AcquisitionReport,
}

impl<R, W> AcquisitionStage<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        reader: FrameReader<R>,
        control: SessionControl<W>,
        commands: mpsc::Receiver<AcquisitionCommand>,
        packets: mpsc::Sender<Packet>,
        cancel: CancellationToken,
        timing: FabricTiming,
        boot_wait: Duration,
    ) -> Self {
        AcquisitionStage {
            reader,
            control,
            commands,
            packets,
            cancel,
            timing,
            boot_wait,
            report: AcquisitionReport::default(),
        }
    }

    /// Read frames until the transport ends, fails, or shutdown is signalled.
    ///
    /// A recording still running on exit is stopped, so its session-ended
    /// signal goes out before the packet queue closes.
    pub async fn run(mut self) -> AcquisitionReport {
        self.await_ready().await;

        loop {
            if self.cancel.is_cancelled() {
                debug!("acquisition shutdown signalled");
                break;
            }
            self.drain_commands().await;

            // A frame still arriving at shutdown is dropped
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("acquisition shutdown signalled during read");
                    break;
                }
                read = self.reader.next_packet() => read,
            };
            match read {
                Ok(Some(frame)) => {
                    let Some(packet) = self.control.stamp(frame) else {
                        self.report.idle_frames += 1;
                        debug!("dropping frame received while not recording");
                        continue;
                    };
                    let delivery = send_with_backpressure(
                        &self.packets,
                        packet,
                        &self.cancel,
                        &self.timing,
                        &mut self.report.queue,
                        STAGE,
                    )
                    .await;
                    match delivery {
                        Delivery::Sent => self.report.queue.emitted += 1,
                        Delivery::Shutdown => break,
                        Delivery::Closed => {
                            warn!("packet queue closed");
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("device transport closed");
                    break;
                }
                Err(FrameError::Stalled) => {}
                Err(e) if e.is_desync() => {
                    if self.control.is_recording() {
                        warn!(session = self.control.session(), error = %e, "frame desynchronized");
                    } else {
                        debug!(error = %e, "frame desynchronized while idle");
                    }
                }
                Err(e) if e.is_recoverable() => warn!(error = %e, "resynchronization attempt failed"),
                Err(e) => {
                    error!(error = %e, "device transport failed");
                    break;
                }
            }
        }

        self.control.stop().await;
        self.report.frames = self.reader.stats().clone();
        self.report.sessions = self.control.session();
        info!(
            packets = self.report.queue.emitted,
            sessions = self.report.sessions,
            desync_events = self.report.frames.desync_events,
            "acquisition stopped"
        );
        self.report
    }

    async fn await_ready(&mut self) {
        match self.reader.read_reply(self.boot_wait).await {
            Ok(Some(DeviceReply::Ready)) => info!("device ready"),
            Ok(Some(reply)) => debug!(?reply, "unexpected line while waiting for device"),
            Ok(None) => debug!("no READY line from device"),
            Err(e) => warn!(error = %e, "failed waiting for device"),
        }
    }

    /// Handle every queued command before the next read
    async fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle(command).await,
                // A dropped handle leaves the transport and shutdown to end the run
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    async fn handle(&mut self, command: AcquisitionCommand) {
        match command {
            AcquisitionCommand::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            AcquisitionCommand::Stop(reply) => {
                let _ = reply.send(self.control.stop().await);
            }
            AcquisitionCommand::Toggle(reply) => {
                let result = if self.control.is_recording() {
                    self.control.stop().await;
                    Ok(false)
                } else {
                    self.start().await.map(|_| true)
                };
                let _ = reply.send(result);
            }
            AcquisitionCommand::Ping(reply) => {
                let result = if self.control.is_recording() {
                    // Replies would be interleaved with frames
                    debug!("ping skipped while recording");
                    Ok(false)
                } else {
                    self.control.ping(&mut self.reader).await.map_err(transport_error)
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self) -> EcgResult<u64> {
        self.control.start(&mut self.reader).await.map_err(transport_error)
    }
}

fn transport_error(e: FrameError) -> EcgError {
    EcgError::StageFailed {
        stage: STAGE,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameReaderConfig;
    use ecg_core::MARKER;
    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_shutdown_interrupts_trickling_frame() {
        let (host, mut device) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(host);
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        let (_command_tx, command_rx) = mpsc::channel(8);
        let (packet_tx, _packet_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let stage = AcquisitionStage::new(
            FrameReader::new(read_half, FrameReaderConfig::default()),
            SessionControl::new(write_half, control_tx, Duration::from_millis(20)),
            command_rx,
            packet_tx,
            cancel.clone(),
            FabricTiming::default(),
            Duration::from_millis(10),
        );
        let task = tokio::spawn(stage.run());

        // After the boot wait, a frame starts and then arrives one byte at a time
        let trickle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            device.write_all(MARKER).await.unwrap();
            let mut written = 0u32;
            while device.write_all(&[0x55]).await.is_ok() {
                written += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            written
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let cancelled_at = Instant::now();
        let report = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        let elapsed = cancelled_at.elapsed();
        assert!(elapsed < Duration::from_millis(100), "acquisition exited {:?} after shutdown", elapsed);
        assert_eq!(report.frames.packets, 0);
        assert_eq!(report.idle_frames, 0);

        // The stage dropped the transport, which ends the writer
        let written = tokio::time::timeout(Duration::from_secs(1), trickle).await.unwrap().unwrap();
        assert!(written > 0);
    }
}
