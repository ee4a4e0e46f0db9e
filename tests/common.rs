#![allow(unused)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use quality_scaler::{BandwidthScalerUsageHandler, ResourceListener};
use quality_scaler::{ResourceListenerResponse, ResourceUsageState};

pub fn init_log() {
    use std::env;
    use std::sync::Once;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "quality_scaler=debug");
    }

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();
    });
}

/// Counts handler calls.
#[derive(Debug, Default)]
pub struct Counter {
    high: AtomicUsize,
    low: AtomicUsize,
}

impl Counter {
    pub fn high(&self) -> usize {
        self.high.load(Ordering::SeqCst)
    }

    pub fn low(&self) -> usize {
        self.low.load(Ordering::SeqCst)
    }
}

impl BandwidthScalerUsageHandler for Counter {
    fn on_report_usage_bandwidth_high(&self) {
        self.high.fetch_add(1, Ordering::SeqCst);
    }

    fn on_report_usage_bandwidth_low(&self) {
        self.low.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records resource measurements.
#[derive(Debug, Default)]
pub struct Listener {
    pub measured: Mutex<Vec<(String, ResourceUsageState)>>,
}

impl Listener {
    pub fn states(&self) -> Vec<ResourceUsageState> {
        self.measured.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

impl ResourceListener for Listener {
    fn on_resource_usage_state_measured(
        &self,
        resource: &str,
        state: ResourceUsageState,
    ) -> ResourceListenerResponse {
        self.measured
            .lock()
            .unwrap()
            .push((resource.to_string(), state));
        ResourceListenerResponse::Nothing
    }
}
