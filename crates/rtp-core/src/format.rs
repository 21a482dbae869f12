//! RTP payload formats.
//!
//! A payload format defines how PCM samples map to RTP payload bytes and
//! carries the stream's clock rate and channel count. The registry is
//! runtime-populated: the two L16 formats of RFC 3551 are pre-registered,
//! and a "multitrack" family with arbitrary channel counts can be added
//! under dynamic payload types.
//!
//! Encoders and decoders are behind trait objects: payload codecs are the
//! plugin seam of the packet pipeline.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};
use crate::RtpTimestamp;

/// Payload type for L16 stereo at 44100 Hz (RFC 3551).
pub const PAYLOAD_TYPE_L16_STEREO: u8 = 10;

/// Payload type for L16 mono at 44100 Hz (RFC 3551).
pub const PAYLOAD_TYPE_L16_MONO: u8 = 11;

/// Decodes RTP payloads into interleaved `f32` samples.
///
/// The decoder is driven packet by packet: `begin` hands it one payload,
/// `read`/`shift` consume it, `end` finishes it. Positions and counts are in
/// samples per channel.
pub trait FrameDecoder: Send {
    /// Start decoding a payload whose first sample has the given timestamp.
    fn begin(&mut self, timestamp: RtpTimestamp, payload: Bytes);

    /// Timestamp of the next sample `read` would produce.
    fn position(&self) -> RtpTimestamp;

    /// Number of samples per channel left in the current payload.
    fn available(&self) -> u32;

    /// Decode up to `samples.len() / channels` samples per channel into the
    /// interleaved buffer. Returns the number decoded per channel.
    fn read(&mut self, samples: &mut [f32]) -> usize;

    /// Skip `n` samples per channel. Returns the number actually skipped.
    fn shift(&mut self, n: u32) -> u32;

    /// Finish the current payload.
    fn end(&mut self);

    /// Samples per channel contained in a payload of `payload_size` bytes.
    fn payload_duration(&self, payload_size: usize) -> u32;
}

/// Encodes interleaved `f32` samples into an RTP payload.
pub trait FrameEncoder: Send {
    /// Payload size in bytes for `n_samples` samples per channel.
    fn encoded_byte_count(&self, n_samples: usize) -> usize;

    /// Start a payload sized for `n_samples` samples per channel.
    fn begin(&mut self, n_samples: usize);

    /// Append interleaved samples. Returns samples per channel written.
    fn write(&mut self, samples: &[f32]) -> usize;

    /// Finish and return the payload. Unwritten space is zero samples.
    fn end(&mut self) -> Bytes;
}

/// A registered payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// RTP payload type.
    pub payload_type: u8,
    /// Stream clock rate, Hz.
    pub clock_rate: u32,
    /// Number of interleaved channels.
    pub channels: u32,
}

impl Format {
    /// Create a decoder for this format.
    pub fn new_decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(L16Decoder::new(self.channels))
    }

    /// Create an encoder for this format.
    pub fn new_encoder(&self) -> Box<dyn FrameEncoder> {
        Box::new(L16Encoder::new(self.channels))
    }
}

/// Payload format registry.
pub struct FormatRegistry {
    formats: Vec<Format>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        FormatRegistry::new()
    }
}

impl FormatRegistry {
    /// Create a registry with the mandatory L16 formats pre-registered.
    pub fn new() -> Self {
        FormatRegistry {
            formats: vec![
                Format {
                    payload_type: PAYLOAD_TYPE_L16_STEREO,
                    clock_rate: 44100,
                    channels: 2,
                },
                Format {
                    payload_type: PAYLOAD_TYPE_L16_MONO,
                    clock_rate: 44100,
                    channels: 1,
                },
            ],
        }
    }

    /// Look up a format by payload type.
    pub fn find_by_pt(&self, payload_type: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type == payload_type)
    }

    /// Register a multitrack L16 format with an arbitrary channel count
    /// under a dynamic payload type.
    pub fn register_multitrack(
        &mut self,
        payload_type: u8,
        clock_rate: u32,
        channels: u32,
    ) -> Result<()> {
        if !(96..=127).contains(&payload_type) {
            return Err(Error::InvalidArgument(format!(
                "format registry: multitrack payload type must be dynamic: pt={payload_type}"
            )));
        }
        if channels == 0 || clock_rate == 0 {
            return Err(Error::InvalidArgument(
                "format registry: zero clock rate or channels".to_string(),
            ));
        }
        if self.find_by_pt(payload_type).is_some() {
            return Err(Error::InvalidState(format!(
                "format registry: payload type already registered: pt={payload_type}"
            )));
        }

        debug!(payload_type, clock_rate, channels, "format registry: registering format");

        self.formats.push(Format {
            payload_type,
            clock_rate,
            channels,
        });
        Ok(())
    }
}

/// L16 decoder: big-endian signed 16-bit PCM, interleaved.
struct L16Decoder {
    channels: u32,
    payload: Bytes,
    timestamp: RtpTimestamp,
    /// Read offset within the payload, samples per channel.
    offset: u32,
    active: bool,
}

impl L16Decoder {
    fn new(channels: u32) -> Self {
        L16Decoder {
            channels,
            payload: Bytes::new(),
            timestamp: 0,
            offset: 0,
            active: false,
        }
    }

    fn total(&self) -> u32 {
        (self.payload.len() / (2 * self.channels as usize)) as u32
    }
}

impl FrameDecoder for L16Decoder {
    fn begin(&mut self, timestamp: RtpTimestamp, payload: Bytes) {
        debug_assert!(!self.active, "l16 decoder: begin without end");
        self.payload = payload;
        self.timestamp = timestamp;
        self.offset = 0;
        self.active = true;
    }

    fn position(&self) -> RtpTimestamp {
        self.timestamp.wrapping_add(self.offset)
    }

    fn available(&self) -> u32 {
        self.total() - self.offset
    }

    fn read(&mut self, samples: &mut [f32]) -> usize {
        debug_assert!(self.active, "l16 decoder: read without begin");
        let n_chans = self.channels as usize;
        let requested = samples.len() / n_chans;
        let n_decoded = requested.min(self.available() as usize);

        let base = self.offset as usize * 2 * n_chans;
        for i in 0..n_decoded * n_chans {
            let hi = self.payload[base + i * 2];
            let lo = self.payload[base + i * 2 + 1];
            let value = i16::from_be_bytes([hi, lo]);
            samples[i] = value as f32 / 32768.0;
        }

        self.offset += n_decoded as u32;
        n_decoded
    }

    fn shift(&mut self, n: u32) -> u32 {
        let n_shifted = n.min(self.available());
        self.offset += n_shifted;
        n_shifted
    }

    fn end(&mut self) {
        self.payload = Bytes::new();
        self.offset = 0;
        self.active = false;
    }

    fn payload_duration(&self, payload_size: usize) -> u32 {
        (payload_size / (2 * self.channels as usize)) as u32
    }
}

/// L16 encoder: big-endian signed 16-bit PCM, interleaved, with saturation.
struct L16Encoder {
    channels: u32,
    buf: BytesMut,
    /// Capacity of the current payload, samples per channel.
    capacity: usize,
    written: usize,
}

impl L16Encoder {
    fn new(channels: u32) -> Self {
        L16Encoder {
            channels,
            buf: BytesMut::new(),
            capacity: 0,
            written: 0,
        }
    }
}

impl FrameEncoder for L16Encoder {
    fn encoded_byte_count(&self, n_samples: usize) -> usize {
        n_samples * 2 * self.channels as usize
    }

    fn begin(&mut self, n_samples: usize) {
        self.buf = BytesMut::with_capacity(self.encoded_byte_count(n_samples));
        self.capacity = n_samples;
        self.written = 0;
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        let n_chans = self.channels as usize;
        let offered = samples.len() / n_chans;
        let n_written = offered.min(self.capacity - self.written);

        for &sample in &samples[..n_written * n_chans] {
            let value = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
            self.buf.put_i16(value);
        }

        self.written += n_written;
        n_written
    }

    fn end(&mut self) -> Bytes {
        // Pad unwritten space with zero samples so payload size stays fixed.
        let missing = self.encoded_byte_count(self.capacity) - self.buf.len();
        self.buf.put_bytes(0, missing);
        self.capacity = 0;
        self.written = 0;
        std::mem::take(&mut self.buf).freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = FormatRegistry::new();

        let stereo = registry.find_by_pt(PAYLOAD_TYPE_L16_STEREO).unwrap();
        assert_eq!(stereo.channels, 2);
        assert_eq!(stereo.clock_rate, 44100);

        let mono = registry.find_by_pt(PAYLOAD_TYPE_L16_MONO).unwrap();
        assert_eq!(mono.channels, 1);

        assert!(registry.find_by_pt(96).is_none());
    }

    #[test]
    fn test_register_multitrack() {
        let mut registry = FormatRegistry::new();
        registry.register_multitrack(100, 48000, 8).unwrap();

        let format = registry.find_by_pt(100).unwrap();
        assert_eq!(format.channels, 8);

        // Duplicate and non-dynamic registrations are rejected.
        assert!(registry.register_multitrack(100, 48000, 8).is_err());
        assert!(registry.register_multitrack(10, 44100, 2).is_err());
        assert!(registry.register_multitrack(97, 44100, 0).is_err());
    }

    #[test]
    fn test_l16_encode_decode() {
        let format = Format {
            payload_type: 10,
            clock_rate: 44100,
            channels: 2,
        };

        let mut encoder = format.new_encoder();
        let samples = [0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25];
        encoder.begin(3);
        assert_eq!(encoder.write(&samples), 3);
        let payload = encoder.end();
        assert_eq!(payload.len(), 12);

        let mut decoder = format.new_decoder();
        decoder.begin(1000, payload);
        assert_eq!(decoder.position(), 1000);
        assert_eq!(decoder.available(), 3);

        let mut out = [0.0f32; 6];
        assert_eq!(decoder.read(&mut out), 3);
        decoder.end();

        for (a, b) in samples.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1.0 / 32000.0, "{a} vs {b}");
        }
    }

    #[test]
    fn test_l16_shift() {
        let format = Format {
            payload_type: 11,
            clock_rate: 44100,
            channels: 1,
        };

        let mut encoder = format.new_encoder();
        encoder.begin(4);
        encoder.write(&[0.1, 0.2, 0.3, 0.4]);
        let payload = encoder.end();

        let mut decoder = format.new_decoder();
        decoder.begin(500, payload);
        assert_eq!(decoder.shift(2), 2);
        assert_eq!(decoder.position(), 502);
        assert_eq!(decoder.available(), 2);

        let mut out = [0.0f32; 4];
        assert_eq!(decoder.read(&mut out), 2);
        assert!((out[0] - 0.3).abs() < 1e-3);

        // Shift past the end is clipped.
        assert_eq!(decoder.shift(10), 0);
    }

    #[test]
    fn test_encoder_pads_short_payload() {
        let format = Format {
            payload_type: 11,
            clock_rate: 44100,
            channels: 1,
        };

        let mut encoder = format.new_encoder();
        encoder.begin(4);
        encoder.write(&[0.5]);
        let payload = encoder.end();
        assert_eq!(payload.len(), 8);
        assert_eq!(&payload[2..], &[0, 0, 0, 0, 0, 0]);
    }
}
