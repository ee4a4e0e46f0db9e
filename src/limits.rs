//! Resolution dependent bitrate bounds.
//!
//! The tables hold experimentally derived values for an encoder running at
//! 30 fps. They are configuration data: callers can replace the table on a
//! scaler at any time, and an empty replacement falls back to the default
//! table for the codec the scaler was configured with.

use serde::{Deserialize, Serialize};

use crate::units::Bitrate;
use crate::ScalerError;

/// Codec families with their own recommended bitrate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum VideoCodec {
    Vp8,
    Vp9,
    #[default]
    H264,
    Av1,
    /// Anything without a dedicated table.
    Generic,
}

/// Bitrate bounds for frames up to `frame_size_pixels`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionBitrateLimits {
    /// Largest frame (width * height) this entry applies to.
    pub frame_size_pixels: u32,
    /// Lowest bitrate at which it's reasonable to start encoding this resolution.
    pub min_start_bitrate: Bitrate,
    /// Lowest bitrate for this resolution.
    pub min_bitrate: Bitrate,
    /// Highest useful bitrate for this resolution.
    pub max_bitrate: Bitrate,
}

impl ResolutionBitrateLimits {
    /// Create an entry, bitrates are in bits per second.
    pub const fn new(frame_size_pixels: u32, min_start_bps: u64, min_bps: u64, max_bps: u64) -> Self {
        ResolutionBitrateLimits {
            frame_size_pixels,
            min_start_bitrate: Bitrate::bps(min_start_bps),
            min_bitrate: Bitrate::bps(min_bps),
            max_bitrate: Bitrate::bps(max_bps),
        }
    }

    /// All three bitrate bounds multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        ResolutionBitrateLimits {
            frame_size_pixels: self.frame_size_pixels,
            min_start_bitrate: self.min_start_bitrate * factor,
            min_bitrate: self.min_bitrate * factor,
            max_bitrate: self.max_bitrate * factor,
        }
    }
}

// Used when QP can not be trusted for quality scaling (typically hardware H264).
const H264_LIMITS: [ResolutionBitrateLimits; 5] = [
    ResolutionBitrateLimits::new(320 * 180, 0, 30_000, 300_000),
    ResolutionBitrateLimits::new(480 * 270, 200_000, 300_000, 500_000),
    ResolutionBitrateLimits::new(640 * 360, 300_000, 500_000, 800_000),
    ResolutionBitrateLimits::new(960 * 540, 500_000, 800_000, 1_500_000),
    ResolutionBitrateLimits::new(1280 * 720, 900_000, 1_500_000, 2_500_000),
];

const VP9_LIMITS: [ResolutionBitrateLimits; 5] = [
    ResolutionBitrateLimits::new(320 * 180, 0, 30_000, 150_000),
    ResolutionBitrateLimits::new(480 * 270, 120_000, 30_000, 300_000),
    ResolutionBitrateLimits::new(640 * 360, 190_000, 30_000, 420_000),
    ResolutionBitrateLimits::new(960 * 540, 350_000, 30_000, 1_000_000),
    ResolutionBitrateLimits::new(1280 * 720, 480_000, 30_000, 1_500_000),
];

/// The default table for a codec family, sorted ascending by frame size.
pub fn default_bitrate_limits(codec: VideoCodec) -> Vec<ResolutionBitrateLimits> {
    match codec {
        VideoCodec::Vp9 => VP9_LIMITS.to_vec(),
        VideoCodec::Vp8 | VideoCodec::H264 | VideoCodec::Av1 | VideoCodec::Generic => {
            H264_LIMITS.to_vec()
        }
    }
}

/// The smallest entry that can hold a frame of `frame_size_pixels`.
///
/// `limits` must be sorted ascending by frame size. `None` if the frame is
/// larger than every entry.
pub fn bitrate_limits_for_resolution(
    limits: &[ResolutionBitrateLimits],
    frame_size_pixels: u32,
) -> Option<ResolutionBitrateLimits> {
    limits
        .iter()
        .find(|l| l.frame_size_pixels >= frame_size_pixels)
        .copied()
}

/// Check that `limits` is sorted ascending by frame size, without duplicates.
pub fn validate_bitrate_limits(limits: &[ResolutionBitrateLimits]) -> Result<(), ScalerError> {
    for (index, pair) in limits.windows(2).enumerate() {
        if pair[0].frame_size_pixels >= pair[1].frame_size_pixels {
            return Err(ScalerError::UnsortedLimits { index: index + 1 });
        }
    }
    Ok(())
}
