//! CPU overuse detection from encode times.
//!
//! The detector keeps a filtered estimate of how much of the time between
//! captured frames is spent encoding. Periodic checks compare that estimate
//! against the thresholds in [`CpuOveruseOptions`] and tell an
//! [`OveruseObserver`] to adapt up or down.

use std::time::{Duration, Instant};

use crate::config::CpuOveruseOptions;
use crate::ScalerError;

mod detector;
mod usage;

pub use detector::OveruseFrameDetector;

/// Why an adaptation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdaptReason {
    /// Encoder is using too much (or little) CPU.
    Cpu,
    /// Encoded quality is off.
    Quality,
}

/// Receives the decisions of an [`OveruseDetector`].
pub trait OveruseObserver {
    /// There is room to increase quality.
    fn adapt_up(&mut self, reason: AdaptReason);

    /// Quality should go down.
    ///
    /// Returns `true` if the detector should check more often from now on.
    fn adapt_down(&mut self, reason: AdaptReason) -> bool;
}

/// Detector fed with capture and encode samples, running its own periodic
/// checks.
///
/// The detector does not keep time itself. [`OveruseDetector::poll_timeout`]
/// says when the next check is due and the owner calls
/// [`OveruseDetector::handle_timeout`] at (or after) that time.
pub trait OveruseDetector: Send {
    /// Start periodic checks with `options`.
    fn start_check_for_overuse(
        &mut self,
        options: CpuOveruseOptions,
        now: Instant,
    ) -> Result<(), ScalerError>;

    /// Stop periodic checks. Samples are still accepted.
    fn stop_check_for_overuse(&mut self);

    /// A frame of `frame_size_pixels` was captured at `time`.
    fn frame_captured(&mut self, frame_size_pixels: u32, time: Instant);

    /// The frame captured at `capture_time` was encoded.
    ///
    /// `encode_duration` is `None` for frames dropped by the encoder.
    fn frame_sent(
        &mut self,
        capture_time: Instant,
        encode_duration: Option<Duration>,
        now: Instant,
    );

    /// When the next check is due, if checks are running.
    fn poll_timeout(&self) -> Option<Instant>;

    /// Run the check if it is due.
    fn handle_timeout(&mut self, now: Instant, observer: &mut dyn OveruseObserver);
}
