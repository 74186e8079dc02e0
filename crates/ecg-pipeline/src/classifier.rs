//! Classifier contract and the fallback guard around it

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Rhythm labels the classifier may assign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RhythmClass {
    Nsr = 0,
    Afib = 1,
    Pvc = 2,
    Lbbb = 3,
}

impl RhythmClass {
    pub const ALL: [RhythmClass; 4] = [RhythmClass::Nsr, RhythmClass::Afib, RhythmClass::Pvc, RhythmClass::Lbbb];

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(&self) -> u32 {
        *self as u32
    }

    pub fn label(&self) -> &'static str {
        match self {
            RhythmClass::Nsr => "NSR",
            RhythmClass::Afib => "AFIB",
            RhythmClass::Pvc => "PVC",
            RhythmClass::Lbbb => "LBBB",
        }
    }
}

impl fmt::Display for RhythmClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of scoring one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class: u32,
    pub label: String,
    /// In `[0, 1]`
    pub confidence: f32,
}

impl Classification {
    pub fn new(class: RhythmClass, confidence: f32) -> Self {
        Classification {
            class: class.index(),
            label: class.label().to_string(),
            confidence,
        }
    }

    /// Neutral result used whenever no trustworthy prediction exists
    pub fn fallback() -> Self {
        Classification::new(RhythmClass::Nsr, 0.0)
    }
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("expected {expected} samples, got {actual}")]
    InvalidInput { expected: usize, actual: usize },

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Scores a normalized core window
pub trait Classifier: Send + Sync {
    fn classify(&self, window: &[f32]) -> Result<Classification, ClassifierError>;

    fn name(&self) -> &str;
}

/// Why the guard substituted the fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FallbackReason {
    Missing,
    Failed,
    InvalidClass,
    InvalidConfidence,
}

impl FallbackReason {
    const COUNT: usize = 4;

    fn slot(&self) -> usize {
        *self as usize
    }
}

/// Wraps an optional classifier so a missing or misbehaving model never stalls the pipeline
pub struct GuardedClassifier {
    inner: Option<Box<dyn Classifier>>,
    reported: [bool; FallbackReason::COUNT],
    fallbacks: u64,
}

impl GuardedClassifier {
    pub fn new(inner: Option<Box<dyn Classifier>>) -> Self {
        GuardedClassifier {
            inner,
            reported: [false; FallbackReason::COUNT],
            fallbacks: 0,
        }
    }

    /// Windows that received the fallback classification
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    pub fn name(&self) -> &str {
        self.inner.as_ref().map_or("none", |c| c.name())
    }

    pub fn classify(&mut self, window: &[f32]) -> Classification {
        let Some(inner) = &self.inner else {
            return self.fall_back(FallbackReason::Missing, "no classifier configured");
        };

        let prediction = match inner.classify(window) {
            Ok(prediction) => prediction,
            Err(e) => return self.fall_back(FallbackReason::Failed, &e.to_string()),
        };
        let Some(class) = RhythmClass::from_index(prediction.class) else {
            let detail = format!("class index {} out of range", prediction.class);
            return self.fall_back(FallbackReason::InvalidClass, &detail);
        };
        if !(prediction.confidence.is_finite() && (0.0..=1.0).contains(&prediction.confidence)) {
            let detail = format!("confidence {} outside [0, 1]", prediction.confidence);
            return self.fall_back(FallbackReason::InvalidConfidence, &detail);
        }
        Classification::new(class, prediction.confidence)
    }

    fn fall_back(&mut self, reason: FallbackReason, detail: &str) -> Classification {
        self.fallbacks += 1;
        let seen = &mut self.reported[reason.slot()];
        if *seen {
            debug!(?reason, detail, "using fallback classification");
        } else {
            *seen = true;
            warn!(?reason, detail, "using fallback classification");
        }
        Classification::fallback()
    }
}
