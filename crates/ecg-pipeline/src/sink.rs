//! Per-session outputs of the terminal consumer

use crate::classifier::Classification;
use chrono::{DateTime, Local};
use ecg_core::ProcessedWindow;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Identity of an opened recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session: u64,
    pub recording_id: Uuid,
    /// `ecg_<ddmmyy>_<HHMMSS>` in local time
    pub label: String,
    pub opened_at: DateTime<Local>,
}

impl SessionInfo {
    pub fn open(session: u64) -> Self {
        let opened_at = Local::now();
        SessionInfo {
            session,
            recording_id: Uuid::new_v4(),
            label: opened_at.format("ecg_%d%m%y_%H%M%S").to_string(),
            opened_at,
        }
    }
}

/// What ended a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Every window announced by the session-ended signal arrived
    Complete,
    /// A window of a later session arrived first
    NewerSession,
    /// The drain grace period ran out after the session ended
    GraceExpired,
    /// The window queue closed
    InputClosed,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub windows: u64,
    /// Windows announced by the session-ended signal, if it arrived
    pub expected: Option<u64>,
    pub reason: CloseReason,
}

/// Receives the classified windows of each session
pub trait SessionSink: Send + 'static {
    fn open(&mut self, info: &SessionInfo);

    fn record(&mut self, info: &SessionInfo, window: &ProcessedWindow, classification: &Classification);

    fn close(&mut self, info: &SessionInfo, summary: &SessionSummary);
}

/// Logs each annotation
#[derive(Debug, Default)]
pub struct LogSink;

impl SessionSink for LogSink {
    fn open(&mut self, info: &SessionInfo) {
        info!(session = info.session, label = %info.label, recording_id = %info.recording_id, "session opened");
    }

    fn record(&mut self, info: &SessionInfo, window: &ProcessedWindow, classification: &Classification) {
        info!(
            session = info.session,
            segment_id = window.segment_id,
            start_time = window.start_time,
            end_time = window.end_time,
            label = %classification.label,
            confidence = format_args!("{:.4}", classification.confidence),
            "window classified"
        );
    }

    fn close(&mut self, info: &SessionInfo, summary: &SessionSummary) {
        info!(
            session = info.session,
            label = %info.label,
            windows = summary.windows,
            expected = ?summary.expected,
            reason = ?summary.reason,
            "session closed"
        );
    }
}

/// Everything a [`MemorySink`] has seen, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Opened {
        session: u64,
        label: String,
    },
    Recorded {
        session: u64,
        segment_id: u64,
        start_time: u32,
        end_time: u32,
        classification: Classification,
    },
    Closed {
        session: u64,
        summary: SessionSummary,
    },
}

/// Collects events for inspection; clones share the same log
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Segment ids recorded for `session`, in arrival order
    pub fn segments(&self, session: u64) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Recorded { session: s, segment_id, .. } if s == session => Some(segment_id),
                _ => None,
            })
            .collect()
    }

    /// Close summaries for `session`
    pub fn closes(&self, session: u64) -> Vec<SessionSummary> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Closed { session: s, summary } if s == session => Some(summary),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: SinkEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl SessionSink for MemorySink {
    fn open(&mut self, info: &SessionInfo) {
        self.push(SinkEvent::Opened {
            session: info.session,
            label: info.label.clone(),
        });
    }

    fn record(&mut self, info: &SessionInfo, window: &ProcessedWindow, classification: &Classification) {
        self.push(SinkEvent::Recorded {
            session: info.session,
            segment_id: window.segment_id,
            start_time: window.start_time,
            end_time: window.end_time,
            classification: classification.clone(),
        });
    }

    fn close(&mut self, info: &SessionInfo, summary: &SessionSummary) {
        self.push(SinkEvent::Closed {
            session: info.session,
            summary: summary.clone(),
        });
    }
}
