//! Measurement Frames and Wire Codec
//!
//! One notification carries one frame: `[timestamp LE 8][count u8]` followed
//! by `count` three-axis samples, each three little-endian `i16`s. A frame
//! never splits across notifications; when the negotiated payload cannot
//! hold every sample, the encoder drops the trailing ones.

use defmt::Format;
use heapless::Vec;

use super::events::{ATT_MTU_MAX, ATT_NOTIFICATION_OVERHEAD};

/// Largest encodable measurement, bounded by the stack's configured MTU.
pub const MAX_BIOSIG_LEN: usize = (ATT_MTU_MAX as usize) - ATT_NOTIFICATION_OVERHEAD;

/// `[u64 timestamp][u8 sample count]`.
pub const FRAME_HEADER_LEN: usize = 9;

/// Three `i16` axes per sample on the wire.
pub const SAMPLE_WIRE_LEN: usize = 6;

/// Frame capacity: the most samples a maximum-MTU notification can carry.
pub const MAX_FRAME_SAMPLES: usize = (MAX_BIOSIG_LEN - FRAME_HEADER_LEN) / SAMPLE_WIRE_LEN;

/// One three-axis measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Format)]
pub struct SampleTriplet {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl SampleTriplet {
    pub const fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }
}

/// A timestamped run of samples, produced by the FIFO drain path and
/// consumed exactly once by the encoder.
#[derive(Debug, Clone)]
pub struct MeasurementFrame {
    timestamp: u64,
    samples: Vec<SampleTriplet, MAX_FRAME_SAMPLES>,
}

impl MeasurementFrame {
    /// Empty frame stamped with the acquisition time of its first sample.
    pub fn new(timestamp: u64) -> Self {
        Self { timestamp, samples: Vec::new() }
    }

    /// All-zero frame of `count` samples, used as the characteristic's
    /// initial value.
    pub fn zeroed(timestamp: u64, count: usize) -> Self {
        let mut frame = Self::new(timestamp);
        for _ in 0..count.min(MAX_FRAME_SAMPLES) {
            // capacity bounded by the loop
            let _ = frame.samples.push(SampleTriplet::default());
        }
        frame
    }

    /// Append a sample. Returns `false` once the frame is full.
    pub fn push(&mut self, sample: SampleTriplet) -> bool {
        self.samples.push(sample).is_ok()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn samples(&self) -> &[SampleTriplet] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == MAX_FRAME_SAMPLES
    }
}

/// Encode `frame` into `buf`, keeping the result within `max_payload`
/// bytes. Trailing samples that do not fit are dropped. Returns the encoded
/// length; zero means even the header did not fit and nothing was written.
pub fn encode_frame(frame: &MeasurementFrame, max_payload: usize, buf: &mut [u8]) -> usize {
    let budget = max_payload.min(buf.len());
    if budget < FRAME_HEADER_LEN {
        return 0;
    }

    let fit = (budget - FRAME_HEADER_LEN) / SAMPLE_WIRE_LEN;
    let count = frame.samples.len().min(fit);

    buf[0..8].copy_from_slice(&frame.timestamp.to_le_bytes());
    buf[8] = count as u8;

    let mut len = FRAME_HEADER_LEN;
    for sample in &frame.samples[..count] {
        buf[len..len + 2].copy_from_slice(&sample.x.to_le_bytes());
        buf[len + 2..len + 4].copy_from_slice(&sample.y.to_le_bytes());
        buf[len + 4..len + 6].copy_from_slice(&sample.z.to_le_bytes());
        len += SAMPLE_WIRE_LEN;
    }

    len
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum DecodeError {
    /// Shorter than the fixed header.
    Truncated,
    /// The sample count promises more bytes than the payload holds.
    CountMismatch,
}

/// A decoded peer notification (central role).
#[derive(Debug, Clone)]
pub struct DecodedMeasurement {
    pub timestamp: u64,
    pub samples: Vec<SampleTriplet, MAX_FRAME_SAMPLES>,
}

/// Decode the fixed wire layout. The layout is convention with the server;
/// there is no schema negotiation.
pub fn decode_frame(data: &[u8]) -> Result<DecodedMeasurement, DecodeError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Truncated);
    }

    let timestamp = u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);
    let count = data[8] as usize;

    if data.len() < FRAME_HEADER_LEN + count * SAMPLE_WIRE_LEN || count > MAX_FRAME_SAMPLES {
        return Err(DecodeError::CountMismatch);
    }

    let mut samples = Vec::new();
    for i in 0..count {
        let at = FRAME_HEADER_LEN + i * SAMPLE_WIRE_LEN;
        // capacity checked against count above
        let _ = samples.push(SampleTriplet {
            x: i16::from_le_bytes([data[at], data[at + 1]]),
            y: i16::from_le_bytes([data[at + 2], data[at + 3]]),
            z: i16::from_le_bytes([data[at + 4], data[at + 5]]),
        });
    }

    Ok(DecodedMeasurement { timestamp, samples })
}
