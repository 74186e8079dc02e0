//! Segmentation windower: packets in, overlapping extended windows out

use crate::config::WindowingConfig;
use ecg_core::{EcgResult, ExtendedWindow, Packet, Sample};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Counters kept by the windower
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowerStats {
    pub packets: u64,
    pub samples: u64,
    pub windows: u64,
    pub sessions: u64,
    pub dropped_packets: u64,
    /// Samples left over when a session ended or the windower finished
    pub discarded_samples: u64,
}

/// Cuts a session's sample stream into extended windows.
///
/// The buffer slides by `core_len` per window. The leading overlap of each
/// window after the first is the last `overlap_len` samples of the previous
/// core, so consecutive cores tile the stream with no gap or duplicate.
#[derive(Debug)]
pub struct Windower {
    config: WindowingConfig,
    session: Option<u64>,
    buffer: Vec<Sample>,
    overlap_tail: Vec<Sample>,
    next_segment: u64,
    stats: WindowerStats,
}

impl Windower {
    pub fn new(config: WindowingConfig) -> EcgResult<Self> {
        config.validate()?;
        Ok(Windower {
            buffer: Vec::with_capacity(config.cut_len() + config.samples_per_packet),
            overlap_tail: Vec::with_capacity(config.overlap_len),
            config,
            session: None,
            next_segment: 0,
            stats: WindowerStats::default(),
        })
    }

    pub fn config(&self) -> &WindowingConfig {
        &self.config
    }

    pub fn stats(&self) -> &WindowerStats {
        &self.stats
    }

    pub fn session(&self) -> Option<u64> {
        self.session
    }

    /// Samples waiting for the next cut
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Windows produced by `samples` samples of one session
    pub fn windows_for_samples(&self, samples: usize) -> usize {
        self.config.windows_for_samples(samples)
    }

    /// Decode a packet and cut every window it completes.
    ///
    /// A packet that fails to decode is dropped and counted.
    pub fn push_packet(&mut self, packet: &Packet) -> Vec<ExtendedWindow> {
        let samples = match packet.decode() {
            Ok(samples) => samples,
            Err(e) => {
                self.stats.dropped_packets += 1;
                warn!(session = packet.session, sequence = packet.sequence, error = %e, "dropping undecodable packet");
                return Vec::new();
            }
        };
        self.stats.packets += 1;
        self.push_samples(packet.session, &samples)
    }

    /// Append samples of `session`, starting a fresh segmentation if the session changed
    pub fn push_samples(&mut self, session: u64, samples: &[Sample]) -> Vec<ExtendedWindow> {
        if self.session != Some(session) {
            self.begin_session(session);
        }
        self.stats.samples += samples.len() as u64;
        self.buffer.extend_from_slice(samples);

        let mut windows = Vec::new();
        while self.buffer.len() >= self.config.cut_len() {
            windows.push(self.cut());
        }
        windows
    }

    fn begin_session(&mut self, session: u64) {
        if let Some(previous) = self.session {
            self.discard_remainder(previous, "session changed");
        }
        info!(session, "segmenting new session");
        self.session = Some(session);
        self.overlap_tail.clear();
        self.next_segment = 0;
        self.stats.sessions += 1;
    }

    fn discard_remainder(&mut self, session: u64, reason: &str) -> usize {
        let remainder = self.buffer.len();
        if remainder > 0 {
            warn!(session, remainder, reason, "discarding samples short of a full window");
            self.stats.discarded_samples += remainder as u64;
        }
        self.buffer.clear();
        remainder
    }

    fn cut(&mut self) -> ExtendedWindow {
        let core_len = self.config.core_len;
        let overlap_len = self.config.overlap_len;
        let cut_len = self.config.cut_len();

        let core_start = self.overlap_tail.len();
        let mut samples = Vec::with_capacity(core_start + cut_len);
        samples.extend_from_slice(&self.overlap_tail);
        samples.extend_from_slice(&self.buffer[..cut_len]);

        self.overlap_tail.clear();
        self.overlap_tail
            .extend_from_slice(&self.buffer[core_len - overlap_len..core_len]);
        self.buffer.drain(..core_len);

        let window = ExtendedWindow {
            session: self.session.unwrap_or_default(),
            segment_id: self.next_segment,
            samples,
            core_start,
            core_len,
        };
        self.next_segment += 1;
        self.stats.windows += 1;
        debug!(session = window.session, segment_id = window.segment_id, len = window.len(), "cut window");
        window
    }

    /// Report the remainder at termination; partial windows are never emitted.
    ///
    /// Returns the number of discarded samples.
    pub fn finish(&mut self) -> usize {
        let remainder = match self.session {
            Some(session) => self.discard_remainder(session, "windower finished"),
            None => 0,
        };
        info!(windows = self.stats.windows, remainder, "segmentation finished");
        remainder
    }
}

impl WindowingConfig {
    /// `0` below `core_len + overlap_len`, else `(n - overlap_len) / core_len`
    pub fn windows_for_samples(&self, samples: usize) -> usize {
        if samples < self.cut_len() {
            0
        } else {
            (samples - self.overlap_len) / self.core_len
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecg_core::{CORE_LEN, EXTENDED_LEN, OVERLAP_LEN, SAMPLES_PER_PACKET};

    fn packet(session: u64, sequence: u64) -> Packet {
        let samples: Vec<Sample> = (0..SAMPLES_PER_PACKET as u64)
            .map(|i| {
                let n = sequence * SAMPLES_PER_PACKET as u64 + i;
                Sample::new((n * 1000 / 360) as u32, (n % 4096) as u16)
            })
            .collect();
        Packet::from_samples(session, sequence, &samples).unwrap()
    }

    fn feed(windower: &mut Windower, session: u64, packets: std::ops::Range<u64>) -> Vec<ExtendedWindow> {
        packets.flat_map(|seq| windower.push_packet(&packet(session, seq))).collect()
    }

    #[test]
    fn test_first_window_after_five_packets() {
        let mut windower = Windower::new(WindowingConfig::default()).unwrap();
        assert!(feed(&mut windower, 1, 0..4).is_empty());
        let windows = feed(&mut windower, 1, 4..5);
        assert_eq!(windows.len(), 1);

        let first = &windows[0];
        assert_eq!(first.segment_id, 0);
        assert_eq!(first.core_start, 0);
        assert_eq!(first.len(), CORE_LEN + OVERLAP_LEN);
        assert_eq!(first.start_time(), Some(0));
        assert_eq!(windower.buffered(), OVERLAP_LEN);
    }

    #[test]
    fn test_k_windows_with_consecutive_ids() {
        let mut windower = Windower::new(WindowingConfig::default()).unwrap();
        let windows = feed(&mut windower, 7, 0..21);
        // 21 packets = 5376 samples
        assert_eq!(windows.len(), windower.windows_for_samples(21 * SAMPLES_PER_PACKET));
        assert_eq!(windows.len(), 5);

        for (i, window) in windows.iter().enumerate() {
            assert_eq!(window.segment_id, i as u64);
            assert_eq!(window.session, 7);
            assert_eq!(window.core().len(), CORE_LEN);
            if i > 0 {
                assert_eq!(window.len(), EXTENDED_LEN);
                assert_eq!(window.core_start, OVERLAP_LEN);
            }
            let core = window.core();
            assert_eq!(window.start_time(), Some(core[0].timestamp_ms));
            assert_eq!(window.end_time(), Some(core[CORE_LEN - 1].timestamp_ms));
            assert!(window.samples.windows(2).all(|p| p[0].timestamp_ms < p[1].timestamp_ms));
        }
    }

    #[test]
    fn test_overlap_continuity_and_no_loss() {
        let mut windower = Windower::new(WindowingConfig::default()).unwrap();
        let windows = feed(&mut windower, 1, 0..16);

        for pair in windows.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let prev_core = prev.core();
            assert_eq!(next.leading_overlap(), &prev_core[CORE_LEN - OVERLAP_LEN..]);
            assert_eq!(prev.trailing_overlap(), &next.core()[..OVERLAP_LEN]);
        }

        let cores: Vec<Sample> = windows.iter().flat_map(|w| w.core().to_vec()).collect();
        let expected: Vec<Sample> = (0..16).flat_map(|seq| packet(1, seq).decode().unwrap()).take(cores.len()).collect();
        assert_eq!(cores, expected);
    }

    #[test]
    fn test_new_session_resets_state() {
        let mut windower = Windower::new(WindowingConfig::default()).unwrap();
        assert_eq!(feed(&mut windower, 1, 0..7).len(), 1);

        let windows = feed(&mut windower, 2, 0..5);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].segment_id, 0);
        assert_eq!(windows[0].core_start, 0);
        assert_eq!(windows[0].session, 2);

        let stats = windower.stats();
        assert_eq!(stats.sessions, 2);
        // 7 packets = 1792 samples, 1024 consumed by the cut
        assert_eq!(stats.discarded_samples, 768);
    }

    #[test]
    fn test_finish_reports_partial_window() {
        let mut windower = Windower::new(WindowingConfig::default()).unwrap();
        feed(&mut windower, 1, 0..3);
        assert_eq!(windower.finish(), 3 * SAMPLES_PER_PACKET);
        assert_eq!(windower.buffered(), 0);
        assert_eq!(windower.stats().windows, 0);
    }

    #[test]
    fn test_malformed_packet_dropped() {
        let mut windower = Windower::new(WindowingConfig::default()).unwrap();
        let windows = windower.push_packet(&Packet::new(1, 0, vec![0u8; 100]));
        assert!(windows.is_empty());
        assert_eq!(windower.stats().dropped_packets, 1);
        assert_eq!(windower.stats().packets, 0);
    }

    #[test]
    fn test_windows_for_samples() {
        let config = WindowingConfig::default();
        assert_eq!(config.windows_for_samples(0), 0);
        assert_eq!(config.windows_for_samples(1279), 0);
        assert_eq!(config.windows_for_samples(1280), 1);
        assert_eq!(config.windows_for_samples(2303), 1);
        assert_eq!(config.windows_for_samples(2304), 2);
    }
}
