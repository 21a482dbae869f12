//! Sample specification and time conversions.

use rstream_rtp_core::{Nanoseconds, SECOND};

use crate::channel::ChannelSet;
use crate::error::{Error, Result};

/// Sample rate plus channel set of a PCM stream.
///
/// Conversions between nanoseconds and sample counts round half away from
/// zero and saturate explicitly: out-of-range results clamp to the extremes
/// of the destination type, with "overall" (all-channel) counts further
/// rounded down to a multiple of the channel count so the divisibility
/// invariant survives saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    sample_rate: u32,
    channels: ChannelSet,
}

impl SampleSpec {
    /// Create a sample spec. The rate must be non-zero.
    pub fn new(sample_rate: u32, channels: ChannelSet) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::InvalidArgument(
                "sample spec: zero sample rate".to_string(),
            ));
        }
        Ok(SampleSpec {
            sample_rate,
            channels,
        })
    }

    /// Sample rate, Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel set.
    pub fn channel_set(&self) -> ChannelSet {
        self.channels
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.num_channels()
    }

    /// Convert a duration to samples per channel.
    pub fn ns_to_samples_per_chan(&self, duration: Nanoseconds) -> Result<usize> {
        if duration < 0 {
            return Err(Error::InvalidArgument(
                "sample spec: negative duration".to_string(),
            ));
        }
        Ok(self.saturating_samples(duration, 1))
    }

    /// Convert samples per channel to a duration.
    pub fn samples_per_chan_to_ns(&self, n_samples: usize) -> Nanoseconds {
        self.saturating_ns(n_samples as f64)
    }

    /// Convert a duration to an overall (all channels) sample count.
    pub fn ns_to_samples_overall(&self, duration: Nanoseconds) -> Result<usize> {
        if duration < 0 {
            return Err(Error::InvalidArgument(
                "sample spec: negative duration".to_string(),
            ));
        }
        Ok(self.saturating_samples(duration, self.num_channels()))
    }

    /// Convert an overall sample count to a duration. The count must divide
    /// evenly by the channel count.
    pub fn samples_overall_to_ns(&self, n_samples: usize) -> Result<Nanoseconds> {
        if n_samples % self.num_channels() != 0 {
            return Err(Error::InvalidArgument(format!(
                "sample spec: overall count not divisible by channels: n={} channels={}",
                n_samples,
                self.num_channels()
            )));
        }
        Ok(self.saturating_ns((n_samples / self.num_channels()) as f64))
    }

    /// Convert a fractional overall sample count to a duration.
    pub fn fract_samples_overall_to_ns(&self, n_samples: f64) -> Nanoseconds {
        self.saturating_ns(n_samples / self.num_channels() as f64)
    }

    /// Convert a signed duration to an RTP timestamp delta.
    pub fn ns_to_rtp_timestamp(&self, delta: Nanoseconds) -> i32 {
        let val = (delta as f64 / SECOND as f64 * self.sample_rate as f64).round();
        if val <= i32::MIN as f64 {
            i32::MIN
        } else if val >= i32::MAX as f64 {
            i32::MAX
        } else {
            val as i32
        }
    }

    /// Convert an RTP timestamp delta to a signed duration.
    pub fn rtp_timestamp_to_ns(&self, delta: i32) -> Nanoseconds {
        self.saturating_signed_ns(delta as f64)
    }

    fn saturating_samples(&self, duration: Nanoseconds, multiplier: usize) -> usize {
        let val = (duration as f64 / SECOND as f64 * self.sample_rate as f64).round();
        let max = usize::MAX as f64;
        if val * multiplier as f64 >= max {
            // Round the extreme down to a channel multiple.
            usize::MAX / multiplier * multiplier
        } else {
            val as usize * multiplier
        }
    }

    fn saturating_ns(&self, n_samples: f64) -> Nanoseconds {
        let val = (n_samples / self.sample_rate as f64 * SECOND as f64).round();
        if val >= i64::MAX as f64 {
            i64::MAX
        } else {
            val as Nanoseconds
        }
    }

    fn saturating_signed_ns(&self, n_samples: f64) -> Nanoseconds {
        let val = (n_samples / self.sample_rate as f64 * SECOND as f64).round();
        if val <= i64::MIN as f64 {
            i64::MIN
        } else if val >= i64::MAX as f64 {
            i64::MAX
        } else {
            val as Nanoseconds
        }
    }
}

impl std::fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}hz/{}", self.sample_rate, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSet, MASK_STEREO};
    use rstream_rtp_core::{MILLISECOND, SECOND};

    fn stereo_spec() -> SampleSpec {
        SampleSpec::new(44100, ChannelSet::surround(MASK_STEREO).unwrap()).unwrap()
    }

    #[test]
    fn test_per_chan_conversions() {
        let spec = stereo_spec();

        assert_eq!(spec.ns_to_samples_per_chan(SECOND).unwrap(), 44100);
        assert_eq!(spec.ns_to_samples_per_chan(0).unwrap(), 0);
        assert!(spec.ns_to_samples_per_chan(-1).is_err());

        assert_eq!(spec.samples_per_chan_to_ns(44100), SECOND);
        assert_eq!(spec.samples_per_chan_to_ns(0), 0);
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        let spec = SampleSpec::new(
            1000,
            ChannelSet::surround(crate::channel::MASK_MONO).unwrap(),
        )
        .unwrap();

        // 1.5 samples rounds to 2, 1.4 rounds to 1.
        assert_eq!(spec.ns_to_samples_per_chan(1_500_000).unwrap(), 2);
        assert_eq!(spec.ns_to_samples_per_chan(1_400_000).unwrap(), 1);

        assert_eq!(spec.ns_to_rtp_timestamp(-1_500_000), -2);
        assert_eq!(spec.ns_to_rtp_timestamp(-1_400_000), -1);
    }

    #[test]
    fn test_overall_conversions() {
        let spec = stereo_spec();

        assert_eq!(spec.ns_to_samples_overall(SECOND).unwrap(), 88200);
        assert_eq!(
            spec.ns_to_samples_overall(10 * MILLISECOND).unwrap(),
            441 * 2
        );

        assert_eq!(spec.samples_overall_to_ns(88200).unwrap(), SECOND);
        assert!(spec.samples_overall_to_ns(88201).is_err());
    }

    #[test]
    fn test_overall_saturation_keeps_divisibility() {
        let spec = stereo_spec();
        let saturated = spec.ns_to_samples_overall(i64::MAX).unwrap();
        assert_eq!(saturated % 2, 0);
        assert_eq!(saturated, usize::MAX / 2 * 2);
    }

    #[test]
    fn test_rtp_timestamp_conversions() {
        let spec = stereo_spec();

        assert_eq!(spec.ns_to_rtp_timestamp(SECOND), 44100);
        assert_eq!(spec.ns_to_rtp_timestamp(-SECOND), -44100);
        assert_eq!(spec.rtp_timestamp_to_ns(44100), SECOND);
        assert_eq!(spec.rtp_timestamp_to_ns(-44100), -SECOND);

        // Saturation at the i32 extremes.
        assert_eq!(spec.ns_to_rtp_timestamp(i64::MAX), i32::MAX);
        assert_eq!(spec.ns_to_rtp_timestamp(i64::MIN), i32::MIN);
    }
}
