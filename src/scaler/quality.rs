use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{fps_influence_factor, frame_size_pixels, replace_bitrate_limits};
use super::{BandwidthScalerUsageHandler, CheckResult};
use crate::config::ScalerConfig;
use crate::limits::{bitrate_limits_for_resolution, default_bitrate_limits};
use crate::limits::ResolutionBitrateLimits;
use crate::units::{Bitrate, DataSize};
use crate::util::RateStatistics;
use crate::{PeriodicTask, ScalerError};

/// Margin under the upper bound before the bitrate counts as high.
const HIGH_BITRATE_TOLERATION: f64 = 0.95;

/// Margin under the lower bound before the bitrate counts as low.
const LOW_BITRATE_TOLERATION: f64 = 0.8;

/// Quality scaler comparing the windowed encoded bitrate against resolution
/// dependent bounds.
///
/// Every check interval the bitrate over the last interval is classified, and
/// the handler is told about a bitrate outside the bounds straight away. After
/// a report the resolution is forgotten, so the next report can only happen
/// once fresh frames have been encoded.
///
/// ```
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
/// use quality_scaler::{BandwidthQualityScaler, BandwidthScalerUsageHandler};
/// use quality_scaler::{DataSize, PeriodicTask, ScalerConfig};
///
/// struct Handler;
///
/// impl BandwidthScalerUsageHandler for Handler {
///     fn on_report_usage_bandwidth_high(&self) {}
///     fn on_report_usage_bandwidth_low(&self) {}
/// }
///
/// let start = Instant::now();
/// let mut scaler = BandwidthQualityScaler::new(ScalerConfig::new(), Arc::new(Handler), start);
///
/// scaler.report_encode_info(DataSize::bytes(3000), start + Duration::from_millis(33), 640, 360);
///
/// let timeout = scaler.poll_timeout().unwrap();
/// scaler.handle_timeout(timeout);
/// ```
pub struct BandwidthQualityScaler {
    handler: Arc<dyn BandwidthScalerUsageHandler>,
    config: ScalerConfig,
    last_frame_size_pixels: Option<u32>,
    last_time_sent: Option<Instant>,
    encoded_bitrate: RateStatistics,
    each_run_report_frame_count: u32,
    resolution_bitrate_limits: Vec<ResolutionBitrateLimits>,
    next_check: Instant,
}

impl BandwidthQualityScaler {
    /// Create a scaler. The first check is due one interval after `now`.
    pub fn new(
        config: ScalerConfig,
        handler: Arc<dyn BandwidthScalerUsageHandler>,
        now: Instant,
    ) -> Self {
        let interval = config.check_interval();
        debug!(
            "Created BandwidthQualityScaler, checking every {:?} for {:?}",
            interval,
            config.codec()
        );

        BandwidthQualityScaler {
            handler,
            resolution_bitrate_limits: default_bitrate_limits(config.codec()),
            encoded_bitrate: RateStatistics::new(interval),
            config,
            last_frame_size_pixels: None,
            last_time_sent: None,
            each_run_report_frame_count: 0,
            next_check: now + interval,
        }
    }

    /// Report one encoded frame.
    ///
    /// `time_sent` must not go backwards between calls.
    pub fn report_encode_info(
        &mut self,
        frame_size: DataSize,
        time_sent: Instant,
        encoded_width: u32,
        encoded_height: u32,
    ) {
        self.last_time_sent = Some(time_sent);
        self.last_frame_size_pixels = Some(frame_size_pixels(encoded_width, encoded_height));
        self.each_run_report_frame_count += 1;
        self.encoded_bitrate.update(frame_size, time_sent);
    }

    /// Replace the bitrate limits table.
    ///
    /// The table must be sorted ascending by frame size. An empty table
    /// restores the default for the configured codec.
    pub fn set_resolution_bitrate_limits(
        &mut self,
        limits: Vec<ResolutionBitrateLimits>,
    ) -> Result<(), ScalerError> {
        replace_bitrate_limits(&mut self.resolution_bitrate_limits, limits, self.config.codec())
    }

    /// Bitrate limits in use for a resolution.
    pub fn bitrate_limits_for_resolution(
        &self,
        width: u32,
        height: u32,
    ) -> Option<ResolutionBitrateLimits> {
        bitrate_limits_for_resolution(
            &self.resolution_bitrate_limits,
            frame_size_pixels(width, height),
        )
    }

    /// Time between checks.
    pub fn check_interval(&self) -> Duration {
        self.config.check_interval()
    }

    fn check_bitrate(&self) -> CheckResult {
        let (Some(pixels), Some(time_sent)) = (self.last_frame_size_pixels, self.last_time_sent)
        else {
            return CheckResult::InsufficientSamples;
        };

        // No frames this run is an fps factor of zero, which scales every bound to zero.
        if self.each_run_report_frame_count == 0 {
            return CheckResult::InsufficientSamples;
        }

        let Some(current) = self.encoded_bitrate.rate(time_sent) else {
            return CheckResult::InsufficientSamples;
        };

        let Some(limits) = bitrate_limits_for_resolution(&self.resolution_bitrate_limits, pixels)
        else {
            return CheckResult::InsufficientSamples;
        };

        let factor = fps_influence_factor(self.each_run_report_frame_count, self.check_interval());
        let limits = limits.scaled(factor);

        trace!(
            "Encoded {} for {} px over {} frames (fps factor {:.2}), bounds {} - {}",
            current,
            pixels,
            self.each_run_report_frame_count,
            factor,
            limits.min_start_bitrate * LOW_BITRATE_TOLERATION,
            limits.max_bitrate * HIGH_BITRATE_TOLERATION,
        );

        classify(current, &limits)
    }

    fn run_check(&mut self) -> CheckResult {
        let result = self.check_bitrate();

        if result.is_actionable() {
            debug!("Bandwidth check: {:?}", result);
            result.notify(&*self.handler);
            self.last_frame_size_pixels = None;
        } else {
            trace!("Bandwidth check: {:?}", result);
        }

        self.each_run_report_frame_count = 0;
        result
    }
}

impl PeriodicTask for BandwidthQualityScaler {
    fn poll_timeout(&self) -> Option<Instant> {
        Some(self.next_check)
    }

    fn handle_timeout(&mut self, now: Instant) {
        if now < self.next_check {
            return;
        }
        self.run_check();
        self.next_check = now + self.check_interval();
    }
}

fn classify(current: Bitrate, limits: &ResolutionBitrateLimits) -> CheckResult {
    if current > limits.max_bitrate * HIGH_BITRATE_TOLERATION {
        CheckResult::HighBitrate
    } else if current < limits.min_start_bitrate * LOW_BITRATE_TOLERATION {
        CheckResult::LowBitrate
    } else {
        CheckResult::NormalBitrate
    }
}
