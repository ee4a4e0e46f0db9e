use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{fps_influence_factor, frame_size_pixels, replace_bitrate_limits};
use super::{BandwidthScalerUsageHandler, CheckResult};
use crate::config::ScalerConfig;
use crate::limits::{bitrate_limits_for_resolution, default_bitrate_limits};
use crate::limits::ResolutionBitrateLimits;
use crate::units::{Bitrate, DataSize};
use crate::util::ExpFilter;
use crate::{PeriodicTask, ScalerError};

/// Quality scaler acting on a smoothed per frame bitrate, and only after
/// consecutive checks agree.
///
/// Every encoded frame contributes its size over the time since the previous
/// frame to an exponential filter. A check above `max_bitrate` or below
/// `min_bitrate` of the current resolution is counted, and the handler is told
/// once `high_use_consequent_threshold_count` (or
/// `low_use_consequent_threshold_count`) checks in a row went the same way.
/// A normal check clears both counts.
pub struct BandwidthScaler {
    handler: Arc<dyn BandwidthScalerUsageHandler>,
    config: ScalerConfig,
    last_frame_size_pixels: Option<u32>,
    last_time_sent: Option<Instant>,
    /// Size of the frames sent at `last_time_sent`, spread over the gap to the next frame.
    pending: DataSize,
    encoded_bitrate: ExpFilter,
    each_run_report_frame_count: u32,
    high_bitrate_count: u32,
    low_bitrate_count: u32,
    resolution_bitrate_limits: Vec<ResolutionBitrateLimits>,
    next_check: Instant,
}

impl BandwidthScaler {
    /// Create a scaler. The first check is due one interval after `now`.
    pub fn new(
        config: ScalerConfig,
        handler: Arc<dyn BandwidthScalerUsageHandler>,
        now: Instant,
    ) -> Self {
        debug!(
            "Created BandwidthScaler, checking every {:?}, debounce low {} high {}",
            config.check_interval(),
            config.low_use_consequent_threshold_count(),
            config.high_use_consequent_threshold_count(),
        );

        BandwidthScaler {
            handler,
            resolution_bitrate_limits: default_bitrate_limits(config.codec()),
            encoded_bitrate: ExpFilter::new(config.filter_alpha()),
            next_check: now + config.check_interval(),
            config,
            last_frame_size_pixels: None,
            last_time_sent: None,
            pending: DataSize::ZERO,
            each_run_report_frame_count: 0,
            high_bitrate_count: 0,
            low_bitrate_count: 0,
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
        match self.last_time_sent {
            Some(last) if time_sent > last => {
                let elapsed = time_sent - last;
                let sample = self.pending / elapsed;
                let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
                self.encoded_bitrate.apply(elapsed_ms, sample.as_f64());
                self.pending = frame_size;
            }
            // First frame, or another one sent at the same instant.
            _ => self.pending += frame_size,
        }

        self.last_time_sent = Some(time_sent);
        self.last_frame_size_pixels = Some(frame_size_pixels(encoded_width, encoded_height));
        self.each_run_report_frame_count += 1;
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

    /// The smoothed encoded bitrate, if any frames have been seen.
    pub fn encoded_bitrate(&self) -> Option<Bitrate> {
        self.encoded_bitrate.filtered().map(Bitrate::from)
    }

    fn check_bitrate(&self) -> CheckResult {
        let Some(pixels) = self.last_frame_size_pixels else {
            return CheckResult::InsufficientSamples;
        };

        // No frames this run is an fps factor of zero, which scales every bound to zero.
        if self.each_run_report_frame_count == 0 {
            return CheckResult::InsufficientSamples;
        }

        let Some(current) = self.encoded_bitrate() else {
            return CheckResult::InsufficientSamples;
        };

        let Some(limits) = bitrate_limits_for_resolution(&self.resolution_bitrate_limits, pixels)
        else {
            return CheckResult::InsufficientSamples;
        };

        let factor = fps_influence_factor(self.each_run_report_frame_count, self.check_interval());
        let limits = limits.scaled(factor);

        trace!(
            "Smoothed {} for {} px (fps factor {:.2}), bounds {} - {}",
            current,
            pixels,
            factor,
            limits.min_bitrate,
            limits.max_bitrate
        );

        if current > limits.max_bitrate {
            CheckResult::HighBitrate
        } else if current < limits.min_bitrate {
            CheckResult::LowBitrate
        } else {
            CheckResult::NormalBitrate
        }
    }

    fn run_check(&mut self) -> CheckResult {
        let result = self.check_bitrate();

        let confirmed = match result {
            CheckResult::HighBitrate => {
                self.low_bitrate_count = 0;
                self.high_bitrate_count += 1;
                self.high_bitrate_count >= self.config.high_use_consequent_threshold_count()
            }
            CheckResult::LowBitrate => {
                self.high_bitrate_count = 0;
                self.low_bitrate_count += 1;
                self.low_bitrate_count >= self.config.low_use_consequent_threshold_count()
            }
            CheckResult::NormalBitrate => {
                self.high_bitrate_count = 0;
                self.low_bitrate_count = 0;
                false
            }
            CheckResult::InsufficientSamples => false,
        };

        if confirmed {
            debug!("Bandwidth check confirmed: {:?}", result);
            result.notify(&*self.handler);
            self.high_bitrate_count = 0;
            self.low_bitrate_count = 0;
            self.last_frame_size_pixels = None;
        } else {
            trace!(
                "Bandwidth check: {:?} (high {}, low {})",
                result,
                self.high_bitrate_count,
                self.low_bitrate_count
            );
        }

        self.each_run_report_frame_count = 0;
        result
    }
}

impl PeriodicTask for BandwidthScaler {
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
