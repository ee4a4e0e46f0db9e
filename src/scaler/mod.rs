//! Bitrate driven quality scaling.
//!
//! Both scalers measure the bitrate coming out of the encoder and compare it to
//! bounds for the current resolution. The bounds assume 30 fps and are scaled
//! down for encoders producing fewer frames.
//!
//! ## Direction of the reports
//!
//! The handler calls are named for the bandwidth usage they report, which is
//! the inverse of the measurement that triggers them:
//!
//! | Measured encoded bitrate | Result                      | Handler call                           |
//! |--------------------------|-----------------------------|----------------------------------------|
//! | above the upper bound    | [`CheckResult::HighBitrate`] | `on_report_usage_bandwidth_low()`      |
//! | below the lower bound    | [`CheckResult::LowBitrate`]  | `on_report_usage_bandwidth_high()`     |
//!
//! An encoder overshooting the bounds of its resolution has bandwidth to spare
//! for a larger one. An encoder undershooting is starved at its current
//! resolution.

use std::time::Duration;

use crate::limits::{default_bitrate_limits, validate_bitrate_limits};
use crate::limits::{ResolutionBitrateLimits, VideoCodec};
use crate::ScalerError;

mod debounced;
mod quality;

pub use debounced::BandwidthScaler;
pub use quality::BandwidthQualityScaler;

/// Frame rate the bitrate limit tables are calibrated for.
const DEFAULT_FRAMERATE_FPS: f64 = 30.0;

/// Receiver of the scaling decisions.
///
/// Calls happen from within the periodic check and should return quickly.
pub trait BandwidthScalerUsageHandler: Send + Sync {
    /// The encoded bitrate is short of what the current resolution needs.
    ///
    /// The handler should reduce quality (resolution or frame rate).
    fn on_report_usage_bandwidth_high(&self);

    /// The encoded bitrate exceeds what the current resolution can use.
    ///
    /// The handler may increase quality.
    fn on_report_usage_bandwidth_low(&self);
}

/// Outcome of one periodic check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Nothing to go on yet: no frames, no rate or an unknown resolution.
    InsufficientSamples,
    /// Encoded bitrate within the bounds for the resolution.
    NormalBitrate,
    /// Encoded bitrate above the upper bound. Reported as bandwidth low.
    HighBitrate,
    /// Encoded bitrate below the lower bound. Reported as bandwidth high.
    LowBitrate,
}

impl CheckResult {
    /// Whether the result leads to a handler call.
    pub fn is_actionable(&self) -> bool {
        matches!(self, CheckResult::HighBitrate | CheckResult::LowBitrate)
    }

    pub(crate) fn notify(&self, handler: &dyn BandwidthScalerUsageHandler) {
        match self {
            CheckResult::HighBitrate => handler.on_report_usage_bandwidth_low(),
            CheckResult::LowBitrate => handler.on_report_usage_bandwidth_high(),
            CheckResult::NormalBitrate | CheckResult::InsufficientSamples => {}
        }
    }
}

/// How much of the expected 30 fps we got during one check interval, capped at 1.0.
fn fps_influence_factor(frame_count: u32, check_interval: Duration) -> f64 {
    let expected = check_interval.as_secs_f64() * DEFAULT_FRAMERATE_FPS;
    (frame_count as f64 / expected).min(1.0)
}

/// Replace `table` with `limits`, or with the `codec` default if `limits` is empty.
///
/// `table` is left as is when `limits` isn't sorted.
fn replace_bitrate_limits(
    table: &mut Vec<ResolutionBitrateLimits>,
    limits: Vec<ResolutionBitrateLimits>,
    codec: VideoCodec,
) -> Result<(), ScalerError> {
    if limits.is_empty() {
        debug!("Empty bitrate limits, using defaults for {:?}", codec);
        *table = default_bitrate_limits(codec);
        return Ok(());
    }
    validate_bitrate_limits(&limits)?;
    *table = limits;
    Ok(())
}

fn frame_size_pixels(width: u32, height: u32) -> u32 {
    width.saturating_mul(height)
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct FakeHandler {
        high: AtomicUsize,
        low: AtomicUsize,
    }

    impl FakeHandler {
        pub(crate) fn high(&self) -> usize {
            self.high.load(Ordering::SeqCst)
        }

        pub(crate) fn low(&self) -> usize {
            self.low.load(Ordering::SeqCst)
        }
    }

    impl BandwidthScalerUsageHandler for FakeHandler {
        fn on_report_usage_bandwidth_high(&self) {
            self.high.fetch_add(1, Ordering::SeqCst);
        }

        fn on_report_usage_bandwidth_low(&self) {
            self.low.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fps_factor_is_capped() {
        let interval = Duration::from_secs(5);
        assert_eq!(fps_influence_factor(150, interval), 1.0);
        assert_eq!(fps_influence_factor(300, interval), 1.0);
        assert_eq!(fps_influence_factor(75, interval), 0.5);
        assert_eq!(fps_influence_factor(0, interval), 0.0);
    }

    #[test]
    fn notify_is_inverted() {
        let h = FakeHandler::default();

        CheckResult::HighBitrate.notify(&h);
        assert_eq!((h.high(), h.low()), (0, 1));

        CheckResult::LowBitrate.notify(&h);
        assert_eq!((h.high(), h.low()), (1, 1));

        CheckResult::NormalBitrate.notify(&h);
        CheckResult::InsufficientSamples.notify(&h);
        assert_eq!((h.high(), h.low()), (1, 1));
    }

    #[test]
    fn replace_limits_falls_back_to_codec_default() {
        let custom = vec![ResolutionBitrateLimits::new(1920 * 1080, 1_000_000, 2_000_000, 4_000_000)];
        let mut table = default_bitrate_limits(VideoCodec::H264);

        replace_bitrate_limits(&mut table, custom.clone(), VideoCodec::H264).unwrap();
        assert_eq!(table, custom);

        replace_bitrate_limits(&mut table, vec![], VideoCodec::Vp9).unwrap();
        assert_eq!(table, default_bitrate_limits(VideoCodec::Vp9));
    }

    #[test]
    fn replace_limits_keeps_table_when_unsorted() {
        let mut table = default_bitrate_limits(VideoCodec::H264);
        let unsorted = vec![
            ResolutionBitrateLimits::new(640 * 360, 0, 1, 2),
            ResolutionBitrateLimits::new(320 * 180, 0, 1, 2),
        ];

        let err = replace_bitrate_limits(&mut table, unsorted, VideoCodec::H264).unwrap_err();
        assert!(matches!(err, ScalerError::UnsortedLimits { index: 1 }));
        assert_eq!(table, default_bitrate_limits(VideoCodec::H264));
    }

    #[test]
    fn pixels_saturate() {
        assert_eq!(frame_size_pixels(640, 360), 230_400);
        assert_eq!(frame_size_pixels(u32::MAX, 2), u32::MAX);
    }
}
