//! Bounded queues, timed receives and the generic stage runner

use ecg_core::EcgResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing shared by every stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FabricTiming {
    /// Upper bound on any single blocking receive or send attempt
    pub poll_interval: Duration,
    /// Send attempts one item may time out before a warning is logged
    pub backpressure_warn_after: u32,
}

impl Default for FabricTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            backpressure_warn_after: 10,
        }
    }
}

/// Counters reported by a stage when it exits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub received: u64,
    pub emitted: u64,
    pub errors: u64,
    /// Send attempts that timed out on a full downstream queue
    pub backpressure_waits: u64,
}

/// Result of one timed receive
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    Item(T),
    /// Nothing arrived within the poll interval
    Idle,
    Closed,
    Shutdown,
}

/// Result of a send under backpressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Shutdown,
    Closed,
}

/// Receive one item, giving up after `poll` or as soon as shutdown is signalled
pub async fn recv_or_shutdown<T>(
    rx: &mut mpsc::Receiver<T>,
    cancel: &CancellationToken,
    poll: Duration,
) -> Recv<T> {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Recv::Shutdown,

        received = timeout(poll, rx.recv()) => match received {
            Ok(Some(item)) => Recv::Item(item),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Idle,
        },
    }
}

/// Send `item`, blocking while the queue is full.
///
/// Each attempt is bounded by the poll interval and re-checks shutdown, so
/// the item is only abandoned when the pipeline is stopping.
pub async fn send_with_backpressure<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
    timing: &FabricTiming,
    stats: &mut StageStats,
    stage: &'static str,
) -> Delivery {
    let mut item = item;
    let mut waits = 0u32;
    loop {
        match tx.send_timeout(item, timing.poll_interval).await {
            Ok(()) => return Delivery::Sent,
            Err(SendTimeoutError::Timeout(returned)) => {
                waits += 1;
                stats.backpressure_waits += 1;
                if waits == timing.backpressure_warn_after {
                    warn!(stage, waits, capacity = tx.max_capacity(), "downstream queue full");
                }
                if cancel.is_cancelled() {
                    return Delivery::Shutdown;
                }
                item = returned;
            }
            Err(SendTimeoutError::Closed(_)) => return Delivery::Closed,
        }
    }
}

/// A transformation run as an independent pipeline task
pub trait Stage: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// Handle one unit of work; an error drops that unit only
    fn process(&mut self, input: Self::Input) -> EcgResult<Vec<Self::Output>>;

    /// Called once after the input closes or shutdown is signalled
    fn finish(&mut self) {}
}

/// Run `stage` between two queues until its input closes or shutdown is signalled.
///
/// The output sender is dropped on exit, so closure cascades downstream.
pub fn spawn_stage<S: Stage>(
    mut stage: S,
    mut input: mpsc::Receiver<S::Input>,
    output: mpsc::Sender<S::Output>,
    cancel: CancellationToken,
    timing: FabricTiming,
) -> JoinHandle<StageStats> {
    tokio::spawn(async move {
        let name = stage.name();
        let mut stats = StageStats::default();
        debug!(stage = name, "stage started");

        'run: loop {
            let item = match recv_or_shutdown(&mut input, &cancel, timing.poll_interval).await {
                Recv::Item(item) => item,
                Recv::Idle => continue,
                Recv::Closed => {
                    debug!(stage = name, "input closed");
                    break;
                }
                Recv::Shutdown => {
                    debug!(stage = name, "shutdown signalled");
                    break;
                }
            };
            stats.received += 1;

            let outputs = match stage.process(item) {
                Ok(outputs) => outputs,
                Err(e) => {
                    stats.errors += 1;
                    warn!(stage = name, error = %e, "dropping unit of work");
                    continue;
                }
            };
            for out in outputs {
                match send_with_backpressure(&output, out, &cancel, &timing, &mut stats, name).await {
                    Delivery::Sent => stats.emitted += 1,
                    Delivery::Shutdown | Delivery::Closed => break 'run,
                }
            }
        }

        stage.finish();
        drop(output);
        info!(
            stage = name,
            received = stats.received,
            emitted = stats.emitted,
            errors = stats.errors,
            backpressure_waits = stats.backpressure_waits,
            "stage stopped"
        );
        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecg_core::EcgError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fast() -> FabricTiming {
        FabricTiming {
            poll_interval: Duration::from_millis(10),
            backpressure_warn_after: 3,
        }
    }

    struct Doubler {
        finished: Arc<AtomicBool>,
    }

    impl Stage for Doubler {
        type Input = i32;
        type Output = i32;

        fn name(&self) -> &'static str {
            "doubler"
        }

        fn process(&mut self, input: i32) -> EcgResult<Vec<i32>> {
            if input < 0 {
                return Err(EcgError::StageFailed {
                    stage: "doubler",
                    reason: "negative input".to_string(),
                });
            }
            Ok(vec![input, input])
        }

        fn finish(&mut self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_recv_reports_idle_closed_and_shutdown() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<u8>(4);
        let poll = Duration::from_millis(10);

        assert_eq!(recv_or_shutdown(&mut rx, &cancel, poll).await, Recv::Idle);
        tx.send(7).await.unwrap();
        assert_eq!(recv_or_shutdown(&mut rx, &cancel, poll).await, Recv::Item(7));
        cancel.cancel();
        assert_eq!(recv_or_shutdown(&mut rx, &cancel, poll).await, Recv::Shutdown);

        drop(tx);
        let live = CancellationToken::new();
        assert_eq!(recv_or_shutdown(&mut rx, &live, poll).await, Recv::Closed);
    }

    #[tokio::test]
    async fn test_backpressure_blocks_until_consumer_drains() {
        let capacity = 4;
        let (tx, mut rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let timing = fast();

        let producer = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut stats = StageStats::default();
                for i in 0..=capacity {
                    assert_eq!(
                        send_with_backpressure(&tx, i, &cancel, &timing, &mut stats, "producer").await,
                        Delivery::Sent
                    );
                }
                stats
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!producer.is_finished());

        let mut received = Vec::new();
        for _ in 0..=capacity {
            received.push(rx.recv().await.unwrap());
        }
        let stats = producer.await.unwrap();
        assert_eq!(received, (0..=capacity).collect::<Vec<_>>());
        assert!(stats.backpressure_waits >= 1);
    }

    #[tokio::test]
    async fn test_blocked_send_abandons_on_shutdown() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut stats = StageStats::default();
        tx.send(0).await.unwrap();
        cancel.cancel();
        let delivery = send_with_backpressure(&tx, 1, &cancel, &fast(), &mut stats, "test").await;
        assert_eq!(delivery, Delivery::Shutdown);
        assert_eq!(stats.backpressure_waits, 1);
    }

    #[tokio::test]
    async fn test_stage_forwards_skips_errors_and_cascades_close() {
        let finished = Arc::new(AtomicBool::new(false));
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = spawn_stage(
            Doubler {
                finished: finished.clone(),
            },
            in_rx,
            out_tx,
            CancellationToken::new(),
            fast(),
        );

        for value in [1, -1, 2] {
            in_tx.send(value).await.unwrap();
        }
        drop(in_tx);

        let mut outputs = Vec::new();
        while let Some(value) = out_rx.recv().await {
            outputs.push(value);
        }
        assert_eq!(outputs, vec![1, 1, 2, 2]);

        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.emitted, 4);
        assert_eq!(stats.errors, 1);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stage_exits_on_shutdown() {
        let (_in_tx, in_rx) = mpsc::channel::<i32>(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_stage(
            Doubler {
                finished: Arc::new(AtomicBool::new(false)),
            },
            in_rx,
            out_tx,
            cancel.clone(),
            fast(),
        );

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.received, 0);
    }
}
