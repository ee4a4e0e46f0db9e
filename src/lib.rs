//! Sans I/O quality scaling for real time video.
//!
//! The scalers in this crate watch a live signal from a video encoder, the
//! encoded bitrate or the time spent encoding, and tell a controller when the
//! video should go up or down in quality. They do not own any clock, thread or
//! timer. Every operation takes the current [`Instant`] and each scaler
//! exposes the next time it wants to run a check via [`PeriodicTask`].
//!
//! # Scalers
//!
//! * [`BandwidthQualityScaler`] measures the encoded bitrate over a sliding
//!   window and compares it to resolution dependent bounds every check
//!   interval. A bitrate outside the bounds is reported at once.
//! * [`BandwidthScaler`] smooths the per frame bitrate with an exponential
//!   filter and only reports when several consecutive checks agree.
//! * [`EncodeUsageResource`] runs an [`OveruseDetector`] (by default
//!   [`OveruseFrameDetector`]) measuring encode time against the capture
//!   interval.
//!
//! Bounds for the bandwidth scalers come from a table of
//! [`ResolutionBitrateLimits`], picked per [`VideoCodec`] unless a table is set.
//!
//! # Driving
//!
//! The owner calls [`PeriodicTask::handle_timeout`] when
//! [`PeriodicTask::poll_timeout`] has passed.
//!
//! ```
//! # use std::sync::Arc;
//! # use std::time::{Duration, Instant};
//! # use quality_scaler::*;
//! # struct Handler;
//! # impl BandwidthScalerUsageHandler for Handler {
//! #     fn on_report_usage_bandwidth_high(&self) {}
//! #     fn on_report_usage_bandwidth_low(&self) {}
//! # }
//! let start = Instant::now();
//! let mut scaler = BandwidthQualityScaler::new(ScalerConfig::default(), Arc::new(Handler), start);
//!
//! let mut now = start;
//! loop {
//!     now += Duration::from_millis(33);
//!     scaler.report_encode_info(DataSize::bytes(2500), now, 640, 360);
//!
//!     if scaler.poll_timeout().map(|t| t <= now).unwrap_or(false) {
//!         scaler.handle_timeout(now);
//!         break;
//!     }
//! }
//! ```
//!
//! With the `runtime` feature (on by default), [`runtime::TaskHandle`] does
//! this from a tokio task.
//!
//! # Direction of reports
//!
//! [`BandwidthScalerUsageHandler::on_report_usage_bandwidth_low`] is called
//! when the encoder produces *more* than the upper bound for its resolution.
//! The encoder is overshooting, which means there is bandwidth headroom, and
//! the handler is expected to consider increasing the resolution.
//! [`BandwidthScalerUsageHandler::on_report_usage_bandwidth_high`] is the
//! opposite. [`BandwidthScalerResource`] turns these into
//! [`ResourceUsageState::Overuse`] (bandwidth high) and
//! [`ResourceUsageState::Underuse`] (bandwidth low).
//!
//! # Configuration
//!
//! [`ScalerConfig`] is built with `set_*` methods or parsed from a field trial
//! string with [`ScalerConfig::from_field_trial`]. The CPU detector is
//! configured with [`CpuOveruseOptions`].

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]
#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

use std::time::Instant;

use thiserror::Error;

mod config;
pub use config::{CpuOveruseOptions, ScalerConfig, SimulatedOveruse};
pub use config::BANDWIDTH_SCALER_FIELD_TRIAL;

mod limits;
pub use limits::{default_bitrate_limits, ResolutionBitrateLimits, VideoCodec};

mod units;
pub use units::{Bitrate, DataSize};

mod util;
pub use util::{ExpFilter, RateStatistics};

mod scaler;
pub use scaler::{BandwidthQualityScaler, BandwidthScaler};
pub use scaler::{BandwidthScalerUsageHandler, CheckResult};

pub mod overuse;
pub use overuse::{AdaptReason, OveruseDetector, OveruseFrameDetector, OveruseObserver};

mod resource;
pub use resource::{BandwidthScalerResource, EncodeUsageResource};
pub use resource::{ResourceListener, ResourceListenerResponse, ResourceUsageState};

#[cfg(feature = "runtime")]
pub mod runtime;

/// Something that needs to run at a point in time.
///
/// Nothing happens on its own. [`PeriodicTask::poll_timeout`] tells when to
/// call [`PeriodicTask::handle_timeout`] next. Calling it early does nothing.
/// The next deadline is measured from the `now` of the call that ran the
/// check, not from the previous deadline.
pub trait PeriodicTask {
    /// When the next check is due. `None` if there is nothing scheduled.
    fn poll_timeout(&self) -> Option<Instant>;

    /// Run anything due at `now`.
    fn handle_timeout(&mut self, now: Instant);
}

/// Errors for the quality scalers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScalerError {
    /// A field trial string could not be parsed.
    #[error("field trial: {0}")]
    FieldTrial(String),

    /// Bitrate limits not sorted ascending by frame size.
    #[error("bitrate limits not sorted by frame size at index {index}")]
    UnsortedLimits {
        /// First entry not larger than the one before.
        index: usize,
    },

    /// Scaler or detector options that can't be used.
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
}
