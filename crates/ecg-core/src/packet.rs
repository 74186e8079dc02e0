//! Wire representation of device samples and packets
//!
//! A frame on the wire is `MARKER || 256 × (u32 timestamp_ms LE, u16 adc LE)`.

use crate::error::{EcgError, EcgResult};
use serde::{Deserialize, Serialize};

/// Synchronisation marker that opens every frame.
pub const MARKER: &[u8; 6] = b"MARKER";
/// Encoded size of one sample.
pub const SAMPLE_WIRE_SIZE: usize = 6;
/// Samples carried by one packet.
pub const SAMPLES_PER_PACKET: usize = 256;
/// Payload bytes following the marker.
pub const PAYLOAD_SIZE: usize = SAMPLES_PER_PACKET * SAMPLE_WIRE_SIZE;
/// Marker plus payload.
pub const FRAME_SIZE: usize = MARKER.len() + PAYLOAD_SIZE;

/// One ADC reading stamped with the device clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Device time in milliseconds since boot (wraps with the device tick counter)
    pub timestamp_ms: u32,
    /// Raw 16-bit ADC reading
    pub adc_value: u16,
}

impl Sample {
    pub fn new(timestamp_ms: u32, adc_value: u16) -> Self {
        Sample { timestamp_ms, adc_value }
    }

    /// Little-endian wire encoding, timestamp first
    pub fn to_bytes(&self) -> [u8; SAMPLE_WIRE_SIZE] {
        let mut out = [0u8; SAMPLE_WIRE_SIZE];
        out[..4].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[4..].copy_from_slice(&self.adc_value.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; SAMPLE_WIRE_SIZE]) -> Self {
        Sample {
            timestamp_ms: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            adc_value: u16::from_le_bytes([bytes[4], bytes[5]]),
        }
    }
}

/// A framed block of samples as delivered by the frame reader.
///
/// `session` and `sequence` are assigned by the acquisition stage and let
/// downstream stages detect session boundaries without a side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub session: u64,
    pub sequence: u64,
    payload: Vec<u8>,
}

impl Packet {
    /// Wrap a payload without checking its length; [`Packet::decode`] guards it.
    pub fn new(session: u64, sequence: u64, payload: Vec<u8>) -> Self {
        Packet { session, sequence, payload }
    }

    /// Build a packet from exactly [`SAMPLES_PER_PACKET`] samples
    pub fn from_samples(session: u64, sequence: u64, samples: &[Sample]) -> EcgResult<Self> {
        if samples.len() != SAMPLES_PER_PACKET {
            return Err(EcgError::MalformedPacket {
                expected: PAYLOAD_SIZE,
                actual: samples.len() * SAMPLE_WIRE_SIZE,
            });
        }
        Ok(Packet::new(session, sequence, encode_samples(samples)))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload into samples
    pub fn decode(&self) -> EcgResult<Vec<Sample>> {
        if self.payload.len() != PAYLOAD_SIZE {
            return Err(EcgError::MalformedPacket {
                expected: PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        Ok(decode_samples(&self.payload))
    }

    /// Marker followed by the payload, ready to write to a transport
    pub fn encode_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MARKER.len() + self.payload.len());
        frame.extend_from_slice(MARKER);
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Encode samples back to back without a marker
pub fn encode_samples(samples: &[Sample]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(samples.len() * SAMPLE_WIRE_SIZE);
    for sample in samples {
        payload.extend_from_slice(&sample.to_bytes());
    }
    payload
}

/// Decode whole samples; a trailing partial sample is ignored
pub fn decode_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks_exact(SAMPLE_WIRE_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; SAMPLE_WIRE_SIZE];
            raw.copy_from_slice(chunk);
            Sample::from_bytes(raw)
        })
        .collect()
}
