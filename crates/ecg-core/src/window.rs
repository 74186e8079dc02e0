//! Analysis windows exchanged between the windower, the cascade and the classifier

use crate::packet::Sample;
use serde::{Deserialize, Serialize};

/// Core samples scored per window.
pub const CORE_LEN: usize = 1024;
/// Filter margin carried on each side of the core.
pub const OVERLAP_LEN: usize = 256;
/// Full extended window once both margins exist.
pub const EXTENDED_LEN: usize = CORE_LEN + 2 * OVERLAP_LEN;

/// Samples handed to the filter cascade: leading overlap, core, trailing overlap.
///
/// The first window of a session has no leading overlap, so its core starts
/// at index 0 and the window is `core_len + overlap_len` long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedWindow {
    pub session: u64,
    pub segment_id: u64,
    pub samples: Vec<Sample>,
    pub core_start: usize,
    pub core_len: usize,
}

impl ExtendedWindow {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The region that is scored downstream
    pub fn core(&self) -> &[Sample] {
        let end = (self.core_start + self.core_len).min(self.samples.len());
        &self.samples[self.core_start.min(end)..end]
    }

    pub fn leading_overlap(&self) -> &[Sample] {
        &self.samples[..self.core_start.min(self.samples.len())]
    }

    pub fn trailing_overlap(&self) -> &[Sample] {
        let end = (self.core_start + self.core_len).min(self.samples.len());
        &self.samples[end..]
    }

    pub fn start_time(&self) -> Option<u32> {
        self.core().first().map(|s| s.timestamp_ms)
    }

    pub fn end_time(&self) -> Option<u32> {
        self.core().last().map(|s| s.timestamp_ms)
    }

    /// ADC readings of the whole window as floating point
    pub fn adc_values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| f64::from(s.adc_value)).collect()
    }
}

/// A filtered, normalized core window ready for classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedWindow {
    pub session: u64,
    pub segment_id: u64,
    pub start_time: u32,
    pub end_time: u32,
    pub timestamps: Vec<u32>,
    /// Unscaled ADC readings of the core
    pub raw: Vec<u16>,
    /// Cascade output over the core
    pub filtered: Vec<f64>,
    /// Min-max normalized filtered core in `[0, 1]`
    pub normalized: Vec<f32>,
}

impl ProcessedWindow {
    pub fn len(&self) -> usize {
        self.normalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }
}
