//! Terminal consumer: classifies windows and reconciles session ends
//!
//! Windows and `SessionEnded` signals travel on separate channels and may
//! arrive in either order. A session is finalized on the first of:
//! every announced window received, a window of a newer session, a full drain
//! grace period without progress after the signal, or shutdown.

use crate::classifier::GuardedClassifier;
use crate::fabric::FabricTiming;
use crate::session::ControlSignal;
use crate::sink::{CloseReason, SessionInfo, SessionSink, SessionSummary};
use ecg_core::ProcessedWindow;
use ecg_processing::WindowingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters reported when the consumer exits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceReport {
    pub windows: u64,
    pub sessions_finalized: u64,
    /// Windows discarded because their session was already finalized
    pub late_windows: u64,
    pub empty_sessions: u64,
    pub fallbacks: u64,
}

struct OpenSession {
    info: SessionInfo,
    received: u64,
    expected: Option<u64>,
    /// Start of the drain grace; set by the end signal, pushed back by every window after it
    grace_from: Option<Instant>,
}

/// A session-ended signal that arrived before its first window
struct PendingEnd {
    expected: u64,
    ended_at: Instant,
}

pub struct InferenceStage<S> {
    classifier: GuardedClassifier,
    sink: S,
    windowing: WindowingConfig,
    drain_grace: Duration,
    open: Option<OpenSession>,
    pending: BTreeMap<u64, PendingEnd>,
    /// Highest session number already finalized
    finalized: Option<u64>,
    report: InferenceReport,
}

impl<S: SessionSink> InferenceStage<S> {
    pub fn new(classifier: GuardedClassifier, sink: S, windowing: WindowingConfig, drain_grace: Duration) -> Self {
        InferenceStage {
            classifier,
            sink,
            windowing,
            drain_grace,
            open: None,
            pending: BTreeMap::new(),
            finalized: None,
            report: InferenceReport::default(),
        }
    }

    pub fn report(&self) -> &InferenceReport {
        &self.report
    }

    /// Session currently accepting windows
    pub fn open_session(&self) -> Option<u64> {
        self.open.as_ref().map(|open| open.info.session)
    }

    pub fn on_window(&mut self, window: ProcessedWindow, now: Instant) {
        if self.finalized.is_some_and(|last| window.session <= last) {
            self.report.late_windows += 1;
            warn!(
                session = window.session,
                segment_id = window.segment_id,
                "discarding window for finalized session"
            );
            return;
        }

        if self.open.as_ref().is_some_and(|open| open.info.session < window.session) {
            self.finalize(CloseReason::NewerSession);
        }
        if self.open.is_none() {
            self.open_new(window.session);
        }
        let classification = self.classifier.classify(&window.normalized);
        self.report.windows += 1;
        self.report.fallbacks = self.classifier.fallbacks();

        let Some(open) = self.open.as_mut() else {
            return;
        };
        self.sink.record(&open.info, &window, &classification);
        open.received += 1;
        if open.grace_from.is_some() {
            open.grace_from = Some(now);
        }
        debug!(session = open.info.session, segment_id = window.segment_id, label = %classification.label, "window scored");

        if open.expected.is_some_and(|expected| open.received >= expected) {
            self.finalize(CloseReason::Complete);
        }
    }

    pub fn on_signal(&mut self, signal: ControlSignal, now: Instant) {
        let ControlSignal::SessionEnded { session, packets } = signal;
        let samples = packets as usize * self.windowing.samples_per_packet;
        let expected = self.windowing.windows_for_samples(samples) as u64;
        debug!(session, packets, expected, "session ended signal");

        if let Some(open) = self.open.as_mut().filter(|open| open.info.session == session) {
            open.expected = Some(expected);
            open.grace_from = Some(now);
            if open.received >= expected {
                self.finalize(CloseReason::Complete);
            }
            return;
        }

        if self.finalized.is_some_and(|last| session <= last) {
            debug!(session, "session already finalized");
            return;
        }
        if expected == 0 {
            self.report.empty_sessions += 1;
            info!(session, packets, "session ended without a full window");
            return;
        }
        self.pending.insert(session, PendingEnd { expected, ended_at: now });
    }

    /// Finalize or forget sessions whose drain grace has run out
    pub fn expire(&mut self, now: Instant) {
        let grace = self.drain_grace;
        if let Some(grace_from) = self.open.as_ref().and_then(|open| open.grace_from) {
            if now.saturating_duration_since(grace_from) >= grace {
                self.finalize(CloseReason::GraceExpired);
            }
        }
        self.pending.retain(|session, pending| {
            let keep = now.saturating_duration_since(pending.ended_at) < grace;
            if !keep {
                warn!(session, expected = pending.expected, "no window arrived for ended session");
            }
            keep
        });
    }

    /// Close whatever is still open
    pub fn close_all(&mut self, reason: CloseReason) {
        if self.open.is_some() {
            self.finalize(reason);
        }
        self.pending.clear();
    }

    fn open_new(&mut self, session: u64) {
        let info = SessionInfo::open(session);
        self.sink.open(&info);
        info!(session, label = %info.label, recording_id = %info.recording_id, "session opened");

        let pending = self.pending.remove(&session);
        // Signals for older sessions can no longer be matched
        self.pending.retain(|&s, _| s > session);
        self.open = Some(OpenSession {
            info,
            received: 0,
            expected: pending.as_ref().map(|p| p.expected),
            grace_from: pending.map(|p| p.ended_at),
        });
    }

    fn finalize(&mut self, reason: CloseReason) {
        let Some(open) = self.open.take() else {
            return;
        };
        let summary = SessionSummary {
            windows: open.received,
            expected: open.expected,
            reason,
        };
        if let Some(expected) = open.expected {
            if open.received < expected {
                warn!(session = open.info.session, received = open.received, expected, ?reason, "session finalized with missing windows");
            }
        }
        self.sink.close(&open.info, &summary);
        self.finalized = Some(open.info.session);
        self.report.sessions_finalized += 1;
        info!(session = open.info.session, windows = open.received, ?reason, "session finalized");
    }

    /// Consume windows and control signals until the window queue closes or shutdown
    pub async fn run(
        mut self,
        mut windows: mpsc::Receiver<ProcessedWindow>,
        mut control: mpsc::UnboundedReceiver<ControlSignal>,
        cancel: CancellationToken,
        timing: FabricTiming,
    ) -> InferenceReport {
        let mut control_open = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.close_all(CloseReason::Shutdown);
                    break;
                }

                signal = control.recv(), if control_open => match signal {
                    Some(signal) => self.on_signal(signal, Instant::now()),
                    None => control_open = false,
                },

                window = windows.recv() => match window {
                    Some(window) => self.on_window(window, Instant::now()),
                    None => {
                        while let Ok(signal) = control.try_recv() {
                            self.on_signal(signal, Instant::now());
                        }
                        self.close_all(CloseReason::InputClosed);
                        break;
                    }
                },

                _ = tokio::time::sleep(timing.poll_interval) => {}
            }
            self.expire(Instant::now());
        }

        info!(
            windows = self.report.windows,
            sessions = self.report.sessions_finalized,
            late = self.report.late_windows,
            fallbacks = self.report.fallbacks,
            "inference stopped"
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, SinkEvent};
    use ecg_core::CORE_LEN;

    fn stage(sink: MemorySink) -> InferenceStage<MemorySink> {
        InferenceStage::new(
            GuardedClassifier::new(None),
            sink,
            WindowingConfig::default(),
            Duration::from_millis(2000),
        )
    }

    fn window(session: u64, segment_id: u64) -> ProcessedWindow {
        let start = (segment_id * 2844) as u32;
        ProcessedWindow {
            session,
            segment_id,
            start_time: start,
            end_time: start + 2841,
            timestamps: Vec::new(),
            raw: Vec::new(),
            filtered: Vec::new(),
            normalized: vec![0.5; CORE_LEN],
        }
    }

    // 13 packets = 3328 samples -> (3328 - 256) / 1024 = 3 windows
    fn ended(session: u64) -> ControlSignal {
        ControlSignal::SessionEnded { session, packets: 13 }
    }

    #[test]
    fn test_signal_before_last_window() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());
        let now = Instant::now();

        stage.on_window(window(1, 0), Instant::now());
        stage.on_signal(ended(1), now);
        assert!(sink.closes(1).is_empty());
        stage.on_window(window(1, 1), Instant::now());
        stage.on_window(window(1, 2), Instant::now());

        let closes = sink.closes(1);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].windows, 3);
        assert_eq!(closes[0].reason, CloseReason::Complete);
        assert_eq!(sink.segments(1), vec![0, 1, 2]);
        assert_eq!(stage.open_session(), None);
    }

    #[test]
    fn test_signal_after_last_window() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());

        for segment in 0..3 {
            stage.on_window(window(1, segment), Instant::now());
        }
        assert!(sink.closes(1).is_empty());
        stage.on_signal(ended(1), Instant::now());

        let closes = sink.closes(1);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].windows, 3);
        assert_eq!(closes[0].expected, Some(3));
    }

    #[test]
    fn test_signal_before_first_window() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());

        stage.on_signal(ended(1), Instant::now());
        for segment in 0..3 {
            stage.on_window(window(1, segment), Instant::now());
        }
        assert_eq!(sink.closes(1).len(), 1);
        assert_eq!(sink.segments(1).len(), 3);
    }

    #[test]
    fn test_late_window_discarded() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());
        let now = Instant::now();

        stage.on_window(window(1, 0), Instant::now());
        stage.on_signal(ended(1), now);
        stage.expire(now + Duration::from_millis(2500));
        let closes = sink.closes(1);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, CloseReason::GraceExpired);

        stage.on_window(window(1, 1), Instant::now());
        assert_eq!(stage.report().late_windows, 1);
        assert_eq!(sink.segments(1), vec![0]);
        assert_eq!(sink.closes(1).len(), 1);
    }

    #[test]
    fn test_windows_after_signal_extend_grace() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());
        let t0 = Instant::now();

        stage.on_window(window(1, 0), t0);
        stage.on_signal(ended(1), t0);
        stage.on_window(window(1, 1), t0 + Duration::from_millis(1500));
        // Past the grace counted from the signal, within it counted from the last window
        stage.expire(t0 + Duration::from_millis(2100));
        assert!(sink.closes(1).is_empty());
        assert_eq!(stage.open_session(), Some(1));

        stage.on_window(window(1, 2), t0 + Duration::from_millis(2200));
        let closes = sink.closes(1);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, CloseReason::Complete);
        assert_eq!(sink.segments(1), vec![0, 1, 2]);
        assert_eq!(stage.report().late_windows, 0);
    }

    #[test]
    fn test_stalled_session_expires_after_grace() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());
        let t0 = Instant::now();

        stage.on_window(window(1, 0), t0);
        stage.on_signal(ended(1), t0);
        stage.on_window(window(1, 1), t0 + Duration::from_millis(500));
        stage.expire(t0 + Duration::from_millis(2400));
        assert!(sink.closes(1).is_empty());
        stage.expire(t0 + Duration::from_millis(2500));
        let closes = sink.closes(1);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, CloseReason::GraceExpired);
        assert_eq!(closes[0].windows, 2);
    }

    #[test]
    fn test_newer_session_finalizes_previous() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());

        stage.on_window(window(1, 0), Instant::now());
        stage.on_window(window(2, 0), Instant::now());
        assert_eq!(sink.closes(1)[0].reason, CloseReason::NewerSession);
        assert_eq!(stage.open_session(), Some(2));

        stage.close_all(CloseReason::Shutdown);
        assert_eq!(sink.closes(2)[0].reason, CloseReason::Shutdown);
        assert_eq!(stage.report().sessions_finalized, 2);
    }

    #[test]
    fn test_session_without_windows_is_only_logged() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());
        stage.on_signal(ControlSignal::SessionEnded { session: 1, packets: 4 }, Instant::now());
        assert!(sink.events().is_empty());
        assert_eq!(stage.report().empty_sessions, 1);
    }

    #[test]
    fn test_windows_use_fallback_classification() {
        let sink = MemorySink::new();
        let mut stage = stage(sink.clone());
        stage.on_window(window(1, 0), Instant::now());
        let recorded = sink.events().into_iter().find_map(|event| match event {
            SinkEvent::Recorded { classification, .. } => Some(classification),
            _ => None,
        });
        let classification = recorded.unwrap();
        assert_eq!(classification.label, "NSR");
        assert_eq!(classification.confidence, 0.0);
        assert_eq!(stage.report().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_run_handles_either_order_and_input_close() {
        let sink = MemorySink::new();
        let (window_tx, window_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(stage(sink.clone()).run(
            window_rx,
            control_rx,
            CancellationToken::new(),
            FabricTiming::default(),
        ));

        control_tx.send(ended(1)).unwrap();
        for segment in 0..3 {
            window_tx.send(window(1, segment)).await.unwrap();
        }
        for segment in 0..3 {
            window_tx.send(window(2, segment)).await.unwrap();
        }
        control_tx.send(ended(2)).unwrap();
        drop(window_tx);

        let report = task.await.unwrap();
        assert_eq!(report.windows, 6);
        assert_eq!(report.sessions_finalized, 2);
        assert_eq!(sink.closes(1).len(), 1);
        assert_eq!(sink.closes(2).len(), 1);
        assert_eq!(sink.closes(2)[0].windows, 3);
    }
}
