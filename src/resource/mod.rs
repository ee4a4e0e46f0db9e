//! Resources reporting over- and underuse to an adaptation processor.
//!
//! A resource measures something constrained (encode time, bandwidth) and
//! tells a [`ResourceListener`] whenever it finds itself overused or underused.
//! The listener decides how to adapt the video.

mod bandwidth;
mod encode_usage;

pub use bandwidth::BandwidthScalerResource;
pub use encode_usage::EncodeUsageResource;

/// Direction of a resource measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceUsageState {
    /// The resource is overused. Quality should go down.
    Overuse,
    /// The resource has room to spare. Quality may go up.
    Underuse,
}

/// What a listener wants the resource to do after a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceListenerResponse {
    /// Carry on.
    #[default]
    Nothing,
    /// Check more often.
    QualityScalerShouldIncreaseFrequency,
}

/// Receiver of resource measurements.
pub trait ResourceListener: Send + Sync {
    /// `resource` measured `state`.
    fn on_resource_usage_state_measured(
        &self,
        resource: &str,
        state: ResourceUsageState,
    ) -> ResourceListenerResponse;
}
