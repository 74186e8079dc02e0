//! Segmentation and filtering run as fabric stages

use crate::fabric::Stage;
use ecg_core::{EcgResult, ExtendedWindow, Packet, ProcessedWindow};
use ecg_processing::{FilterCascade, Windower};
use std::sync::Arc;

/// Packets in, extended windows out
pub struct SegmentationStage {
    windower: Windower,
}

impl SegmentationStage {
    pub fn new(windower: Windower) -> Self {
        SegmentationStage { windower }
    }
}

impl Stage for SegmentationStage {
    type Input = Packet;
    type Output = ExtendedWindow;

    fn name(&self) -> &'static str {
        "segmentation"
    }

    fn process(&mut self, packet: Packet) -> EcgResult<Vec<ExtendedWindow>> {
        Ok(self.windower.push_packet(&packet))
    }

    fn finish(&mut self) {
        self.windower.finish();
    }
}

/// Extended windows in, filtered and normalized cores out
pub struct FilterStage {
    cascade: Arc<FilterCascade>,
}

impl FilterStage {
    pub fn new(cascade: Arc<FilterCascade>) -> Self {
        FilterStage { cascade }
    }
}

impl Stage for FilterStage {
    type Input = ExtendedWindow;
    type Output = ProcessedWindow;

    fn name(&self) -> &'static str {
        "filter"
    }

    fn process(&mut self, window: ExtendedWindow) -> EcgResult<Vec<ProcessedWindow>> {
        self.cascade.process(&window).map(|processed| vec![processed])
    }
}
