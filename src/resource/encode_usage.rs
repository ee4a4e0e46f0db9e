use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{ResourceListener, ResourceListenerResponse, ResourceUsageState};
use crate::config::CpuOveruseOptions;
use crate::overuse::{AdaptReason, OveruseDetector, OveruseObserver};
use crate::{PeriodicTask, ScalerError};

const NAME: &str = "EncodeUsageResource";

/// Resource reporting CPU over- and underuse measured by an [`OveruseDetector`].
///
/// The detector decides when to adapt. This resource starts and stops it, feeds
/// it samples and turns its `adapt_up`/`adapt_down` into underuse/overuse
/// measurements for the [`ResourceListener`].
pub struct EncodeUsageResource {
    detector: Box<dyn OveruseDetector>,
    listener: Arc<dyn ResourceListener>,
    is_started: bool,
}

impl EncodeUsageResource {
    /// Create a stopped resource.
    pub fn new(detector: Box<dyn OveruseDetector>, listener: Arc<dyn ResourceListener>) -> Self {
        EncodeUsageResource {
            detector,
            listener,
            is_started: false,
        }
    }

    /// Name the resource reports under.
    pub fn name(&self) -> &str {
        NAME
    }

    /// Whether overuse checks are running.
    pub fn is_started(&self) -> bool {
        self.is_started
    }

    /// Start overuse checks.
    ///
    /// Must not be called while already started.
    pub fn start_check_for_overuse(
        &mut self,
        options: CpuOveruseOptions,
        now: Instant,
    ) -> Result<(), ScalerError> {
        debug_assert!(!self.is_started, "EncodeUsageResource already started");
        self.detector.start_check_for_overuse(options, now)?;
        self.is_started = true;
        debug!("{} started", NAME);
        Ok(())
    }

    /// Stop overuse checks. Does nothing if not started.
    pub fn stop_check_for_overuse(&mut self) {
        if !self.is_started {
            return;
        }
        self.detector.stop_check_for_overuse();
        self.is_started = false;
        debug!("{} stopped", NAME);
    }

    /// A frame of `frame_size_pixels` was captured.
    pub fn on_frame_captured(&mut self, frame_size_pixels: u32, now: Instant) {
        self.detector.frame_captured(frame_size_pixels, now);
    }

    /// The frame captured at `capture_time` finished encoding.
    pub fn on_encode_completed(
        &mut self,
        capture_time: Instant,
        encode_duration: Option<Duration>,
        now: Instant,
    ) {
        self.detector.frame_sent(capture_time, encode_duration, now);
    }
}

impl PeriodicTask for EncodeUsageResource {
    fn poll_timeout(&self) -> Option<Instant> {
        if !self.is_started {
            return None;
        }
        self.detector.poll_timeout()
    }

    fn handle_timeout(&mut self, now: Instant) {
        if !self.is_started {
            return;
        }
        let mut reporter = UsageReporter {
            listener: &*self.listener,
        };
        self.detector.handle_timeout(now, &mut reporter);
    }
}

/// Translates detector decisions to resource measurements.
struct UsageReporter<'a> {
    listener: &'a dyn ResourceListener,
}

impl UsageReporter<'_> {
    fn report(&self, state: ResourceUsageState) -> ResourceListenerResponse {
        debug!("{}: {:?}", NAME, state);
        self.listener.on_resource_usage_state_measured(NAME, state)
    }
}

impl OveruseObserver for UsageReporter<'_> {
    fn adapt_up(&mut self, reason: AdaptReason) {
        debug_assert_eq!(reason, AdaptReason::Cpu);
        self.report(ResourceUsageState::Underuse);
    }

    fn adapt_down(&mut self, reason: AdaptReason) -> bool {
        debug_assert_eq!(reason, AdaptReason::Cpu);
        self.report(ResourceUsageState::Overuse)
            == ResourceListenerResponse::QualityScalerShouldIncreaseFrequency
    }
}
