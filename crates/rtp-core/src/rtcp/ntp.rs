//! NTP timestamp representation (RFC 3550 §4).

use crate::Nanoseconds;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// 64-bit NTP timestamp: seconds since 1900 in the upper half, binary
/// fraction of a second in the lower half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900.
    pub seconds: u32,

    /// Fraction of a second, units of 2^-32 s.
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Pack into the 64-bit wire representation.
    pub fn to_u64(self) -> u64 {
        (self.seconds as u64) << 32 | self.fraction as u64
    }

    /// Unpack from the 64-bit wire representation.
    pub fn from_u64(value: u64) -> Self {
        NtpTimestamp {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Convert from nanoseconds since the Unix epoch, saturating at the
    /// representable NTP range.
    pub fn from_unix_ns(ns: Nanoseconds) -> Self {
        if ns <= 0 {
            return NtpTimestamp {
                seconds: NTP_UNIX_OFFSET as u32,
                fraction: 0,
            };
        }

        let seconds = ns / crate::SECOND + NTP_UNIX_OFFSET;
        if seconds > u32::MAX as i64 {
            return NtpTimestamp {
                seconds: u32::MAX,
                fraction: u32::MAX,
            };
        }

        let sub_ns = ns % crate::SECOND;
        let fraction = ((sub_ns as u64) << 32) / crate::SECOND as u64;

        NtpTimestamp {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }

    /// Convert to nanoseconds since the Unix epoch, saturating below at zero
    /// for timestamps that predate it.
    pub fn to_unix_ns(self) -> Nanoseconds {
        let seconds = self.seconds as i64 - NTP_UNIX_OFFSET;
        if seconds < 0 {
            return 0;
        }

        let sub_ns = ((self.fraction as u64 * crate::SECOND as u64) >> 32) as i64;
        seconds.saturating_mul(crate::SECOND).saturating_add(sub_ns)
    }
}
