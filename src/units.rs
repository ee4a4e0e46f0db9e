use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, SubAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A data rate expressed as bits per second(bps).
///
/// Internally the value is tracked as a floating point number since thresholds
/// get scaled by fractional factors before comparison.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bitrate(f64);

impl Bitrate {
    /// No bits at all.
    pub const ZERO: Self = Self::bps(0);

    /// Create a bitrate from bits per second.
    pub const fn bps(bps: u64) -> Self {
        Bitrate(bps as f64)
    }

    /// Create a bitrate from kilobits per second.
    pub const fn kbps(kbps: u64) -> Self {
        Self::bps(kbps * 10_u64.pow(3))
    }

    /// The rate as floating point bits per second.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// The rate rounded up to whole bits per second.
    pub fn as_u64(&self) -> u64 {
        self.0.ceil() as u64
    }
}

impl From<u64> for Bitrate {
    fn from(value: u64) -> Self {
        Self::bps(value)
    }
}

impl From<f64> for Bitrate {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl Mul<f64> for Bitrate {
    type Output = Bitrate;

    fn mul(self, rhs: f64) -> Self::Output {
        Bitrate(self.0 * rhs)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.0;
        if rate < 1.0 {
            return write!(f, "{rate}bit/s");
        }
        let log = rate.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{rate}bit/s"),
            3..=5 => write!(f, "{:.3}kbit/s", rate / 10.0_f64.powf(3.0)),
            6..=8 => write!(f, "{:.3}Mbit/s", rate / 10.0_f64.powf(6.0)),
            9.. => write!(f, "{:.3}Gbit/s", rate / 10.0_f64.powf(9.0)),
        }
    }
}

/// An amount of data in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSize(u64);

impl DataSize {
    /// Empty.
    pub const ZERO: Self = DataSize::bytes(0);

    /// Create a size from a byte count.
    pub const fn bytes(bytes: u64) -> DataSize {
        Self(bytes)
    }

    /// The size in bits as floating point.
    pub fn as_bits_f64(&self) -> f64 {
        self.0 as f64 * 8.0
    }
}

impl Div<Duration> for DataSize {
    type Output = Bitrate;

    fn div(self, rhs: Duration) -> Self::Output {
        (self.as_bits_f64() / rhs.as_secs_f64()).into()
    }
}

impl AddAssign<DataSize> for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        self.0 += rhs.0;
    }
}

impl SubAssign<DataSize> for DataSize {
    fn sub_assign(&mut self, rhs: DataSize) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Add<DataSize> for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.0 as f64;
        if self.0 == 0 {
            return write!(f, "0B");
        }
        let log = size.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{size}B"),
            3..=5 => write!(f, "{:.3}kB", size / 10.0_f64.powf(3.0)),
            6..=8 => write!(f, "{:.3}MB", size / 10.0_f64.powf(6.0)),
            9.. => write!(f, "{:.3}GB", size / 10.0_f64.powf(9.0)),
        }
    }
}
