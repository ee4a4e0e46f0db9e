use std::sync::Arc;

use super::{ResourceListener, ResourceUsageState};
use crate::scaler::BandwidthScalerUsageHandler;

/// Bandwidth scaler handler forwarding the reports to a [`ResourceListener`].
///
/// `on_report_usage_bandwidth_high` is an overuse, `on_report_usage_bandwidth_low`
/// an underuse.
pub struct BandwidthScalerResource {
    name: String,
    listener: Arc<dyn ResourceListener>,
}

impl BandwidthScalerResource {
    /// Create a resource reporting under `name`.
    pub fn new(name: impl Into<String>, listener: Arc<dyn ResourceListener>) -> Self {
        BandwidthScalerResource {
            name: name.into(),
            listener,
        }
    }

    /// Name the resource reports under.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn report(&self, state: ResourceUsageState) {
        debug!("{}: {:?}", self.name, state);
        // Bitrate checks run at a fixed cadence, the response is ignored.
        let _ = self
            .listener
            .on_resource_usage_state_measured(&self.name, state);
    }
}

impl BandwidthScalerUsageHandler for BandwidthScalerResource {
    fn on_report_usage_bandwidth_high(&self) {
        self.report(ResourceUsageState::Overuse);
    }

    fn on_report_usage_bandwidth_low(&self) {
        self.report(ResourceUsageState::Underuse);
    }
}
