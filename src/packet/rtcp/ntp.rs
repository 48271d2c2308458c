use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Offset between the NTP epoch (1900) and the UNIX epoch (1970) in seconds
const NTP_TO_UNIX_OFFSET: u64 = 2_208_988_800;

/// NTP timestamp representation (64 bits) as defined in RFC 3550
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,

    /// Fraction of a second
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Create a new NTP timestamp from the current system time
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self::from_duration_since_unix_epoch(now)
    }

    /// Convert to a 64-bit representation
    pub fn to_u64(&self) -> u64 {
        (self.seconds as u64) << 32 | (self.fraction as u64)
    }

    /// Convert from a 64-bit representation
    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Middle 32 bits of the timestamp, as carried in the LSR field of a
    /// report block (RFC 3550 §6.4.1)
    pub fn to_u32(&self) -> u32 {
        ((self.seconds & 0x0000FFFF) << 16) | ((self.fraction & 0xFFFF0000) >> 16)
    }

    /// Create a new NTP timestamp from a duration since the UNIX epoch
    pub fn from_duration_since_unix_epoch(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_TO_UNIX_OFFSET;

        // Convert nanoseconds to a binary fraction (2^32 / 10^9)
        let nanos = duration.subsec_nanos();
        let fraction = ((nanos as u64 * 0x1_0000_0000u64) / 1_000_000_000) as u32;

        Self {
            seconds: seconds as u32,
            fraction,
        }
    }
}
