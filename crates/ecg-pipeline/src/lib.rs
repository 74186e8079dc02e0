//! ECG-Pipeline: acquisition, segmentation, filtering and inference as concurrent tasks
//!
//! Four tasks joined by bounded queues:
//!
//! ```text
//! acquisition --packets--> segmentation --windows--> filter --processed--> inference
//!      \________________________ session ended __________________________/
//! ```
//!
//! The session-ended signal travels on its own unbounded channel and is
//! reconciled against the window stream by the inference stage.

pub mod acquisition;
pub mod classifier;
pub mod config;
pub mod fabric;
pub mod frame;
pub mod inference;
pub mod session;
pub mod sink;
pub mod stages;

pub use acquisition::{AcquisitionCommand, AcquisitionReport, AcquisitionStage};
pub use classifier::{Classification, Classifier, ClassifierError, GuardedClassifier, RhythmClass};
pub use config::PipelineConfig;
pub use fabric::{spawn_stage, FabricTiming, Stage, StageStats};
pub use frame::{FrameError, FrameReader, FrameReaderConfig, FrameStats, RawFrame, SyncState};
pub use inference::{InferenceReport, InferenceStage};
pub use session::{ControlSignal, SessionControl};
pub use sink::{CloseReason, LogSink, MemorySink, SessionInfo, SessionSink, SessionSummary, SinkEvent};
pub use stages::{FilterStage, SegmentationStage};

use ecg_core::{EcgError, EcgResult};
use ecg_processing::{FilterCascade, Windower};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-task results collected by [`PipelineHandle::join`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub acquisition: AcquisitionReport,
    pub segmentation: StageStats,
    pub filter: StageStats,
    pub inference: InferenceReport,
}

pub struct Pipeline;

impl Pipeline {
    /// Design the cascade, wire the queues and spawn the four tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W, S>(
        config: PipelineConfig,
        reader: R,
        writer: W,
        classifier: Option<Box<dyn Classifier>>,
        sink: S,
    ) -> EcgResult<PipelineHandle>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        S: SessionSink,
    {
        config.validate()?;
        let cascade = Arc::new(FilterCascade::design(&config.cascade)?);
        let windower = Windower::new(config.windowing.clone())?;
        info!(
            stages = cascade.stages().len(),
            min_input_len = cascade.min_input_len(),
            "filter cascade designed"
        );

        let cancel = CancellationToken::new();
        let timing = config.timing();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (packet_tx, packet_rx) = mpsc::channel(config.queue_capacity);
        let (window_tx, window_rx) = mpsc::channel(config.queue_capacity);
        let (processed_tx, processed_rx) = mpsc::channel(config.queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let acquisition = AcquisitionStage::new(
            FrameReader::new(reader, config.reader()),
            SessionControl::new(writer, control_tx, config.ack_timeout()),
            command_rx,
            packet_tx,
            cancel.clone(),
            timing,
            config.boot_wait(),
        );
        let inference = InferenceStage::new(
            GuardedClassifier::new(classifier),
            sink,
            config.windowing.clone(),
            config.drain_grace(),
        );

        let handle = PipelineHandle {
            commands: command_tx,
            cancel: cancel.clone(),
            join_timeout: config.join_timeout(),
            acquisition: tokio::spawn(acquisition.run()),
            segmentation: spawn_stage(SegmentationStage::new(windower), packet_rx, window_tx, cancel.clone(), timing),
            filter: spawn_stage(FilterStage::new(cascade), window_rx, processed_tx, cancel.clone(), timing),
            inference: tokio::spawn(inference.run(processed_rx, control_rx, cancel, timing)),
        };
        info!(queue_capacity = config.queue_capacity, "pipeline started");
        Ok(handle)
    }
}

/// Controls a running pipeline
pub struct PipelineHandle {
    commands: mpsc::Sender<AcquisitionCommand>,
    cancel: CancellationToken,
    join_timeout: Duration,
    acquisition: JoinHandle<AcquisitionReport>,
    segmentation: JoinHandle<StageStats>,
    filter: JoinHandle<StageStats>,
    inference: JoinHandle<InferenceReport>,
}

impl PipelineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> AcquisitionCommand) -> EcgResult<T> {
        let closed = || EcgError::ChannelClosed {
            channel: "acquisition commands",
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(command(reply_tx)).await.map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())
    }

    /// Start recording; returns the session number
    pub async fn start_recording(&self) -> EcgResult<u64> {
        self.request(AcquisitionCommand::Start).await?
    }

    /// Stop recording; returns the ended session, if any
    pub async fn stop_recording(&self) -> EcgResult<Option<u64>> {
        self.request(AcquisitionCommand::Stop).await
    }

    /// Start or stop; returns whether a session is now recording
    pub async fn toggle_recording(&self) -> EcgResult<bool> {
        self.request(AcquisitionCommand::Toggle).await?
    }

    pub async fn ping(&self) -> EcgResult<bool> {
        self.request(AcquisitionCommand::Ping).await?
    }

    /// Signal every task to stop within one poll interval
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every task, aborting any still running when the join timeout runs out
    pub async fn join(self) -> EcgResult<PipelineReport> {
        let deadline = Instant::now() + self.join_timeout;
        let acquisition = join_task("acquisition", self.acquisition, deadline).await;
        let segmentation = join_task("segmentation", self.segmentation, deadline).await;
        let filter = join_task("filter", self.filter, deadline).await;
        let inference = join_task("inference", self.inference, deadline).await;
        Ok(PipelineReport {
            acquisition: acquisition?,
            segmentation: segmentation?,
            filter: filter?,
            inference: inference?,
        })
    }
}

/// Tasks share one deadline, so the whole join is bounded by a single timeout
async fn join_task<T>(stage: &'static str, mut handle: JoinHandle<T>, deadline: Instant) -> EcgResult<T> {
    match timeout_at(deadline, &mut handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EcgError::StageFailed {
            stage,
            reason: e.to_string(),
        }),
        Err(_) => {
            warn!(stage, "task did not stop in time, aborting");
            handle.abort();
            Err(EcgError::StageFailed {
                stage,
                reason: "still running at the join deadline".to_string(),
            })
        }
    }
}
