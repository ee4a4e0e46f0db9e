use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::VideoCodec;
use crate::ScalerError;

/// Name of the experiment group carrying bandwidth scaler overrides.
pub const BANDWIDTH_SCALER_FIELD_TRIAL: &str = "WebRTC-Video-BandwidthScalerSettings";

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CONSEQUENT_THRESHOLD_COUNT: u32 = 2;
const DEFAULT_FILTER_ALPHA: f64 = 0.9995;
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(2);

/// Configuration for [`BandwidthQualityScaler`][crate::BandwidthQualityScaler] and
/// [`BandwidthScaler`][crate::BandwidthScaler].
///
/// ```
/// use std::time::Duration;
/// use quality_scaler::{ScalerConfig, VideoCodec};
///
/// let config = ScalerConfig::new()
///     .set_check_interval(Duration::from_secs(2))
///     .set_codec(VideoCodec::Vp9);
///
/// assert_eq!(config.check_interval(), Duration::from_secs(2));
/// ```
///
/// Deserializing applies the same checks as the setters and fails on values
/// they would refuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConfigFields")]
pub struct ScalerConfig {
    check_interval: Duration,
    codec: VideoCodec,
    low_use_consequent_threshold_count: u32,
    high_use_consequent_threshold_count: u32,
    filter_alpha: f64,
}

impl ScalerConfig {
    /// Creates a new default config.
    pub fn new() -> Self {
        ScalerConfig::default()
    }

    /// Parse overrides from an experiment group string.
    ///
    /// Accepts either the bare parameters (`bitrate_state_update_interval:2`)
    /// or the full trial (`WebRTC-Video-BandwidthScalerSettings/bitrate_state_update_interval:2/`).
    /// Parameters not present keep their default.
    pub fn from_field_trial(trial: &str) -> Result<Self, ScalerError> {
        let mut config = ScalerConfig::default();

        let group = trial
            .strip_prefix(BANDWIDTH_SCALER_FIELD_TRIAL)
            .unwrap_or(trial)
            .trim_matches('/');

        for param in group.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = param.split_once(':') else {
                return Err(ScalerError::FieldTrial(format!("missing value: {param}")));
            };

            match key {
                "bitrate_state_update_interval" => {
                    let secs = parse_positive(key, value)?;
                    config.check_interval = Duration::from_secs(secs as u64);
                }
                "low_use_consequent_threshold_count" => {
                    config.low_use_consequent_threshold_count = parse_positive(key, value)?;
                }
                "high_use_consequent_threshold_count" => {
                    config.high_use_consequent_threshold_count = parse_positive(key, value)?;
                }
                _ => {
                    warn!("Ignoring unknown bandwidth scaler parameter: {}", key);
                    continue;
                }
            }
            info!("Bandwidth scaler override {}: {}", key, value);
        }

        Ok(config)
    }

    /// Time between consecutive periodic checks.
    ///
    /// Also the length of the bitrate measurement window.
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Set the time between consecutive periodic checks.
    ///
    /// Defaults to 5 seconds.
    ///
    /// Panics if the interval is shorter than 2ms.
    pub fn set_check_interval(mut self, interval: Duration) -> Self {
        assert!(interval >= MIN_CHECK_INTERVAL, "check interval too short");
        self.check_interval = interval;
        self
    }

    /// Codec family that selects the default bitrate limits table.
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Set the codec family that selects the default bitrate limits table.
    ///
    /// Defaults to [`VideoCodec::H264`].
    pub fn set_codec(mut self, codec: VideoCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Consecutive checks below the lower bound needed before reporting.
    pub fn low_use_consequent_threshold_count(&self) -> u32 {
        self.low_use_consequent_threshold_count
    }

    /// Set consecutive checks below the lower bound needed before reporting.
    ///
    /// Only used by [`BandwidthScaler`][crate::BandwidthScaler]. Defaults to 2.
    pub fn set_low_use_consequent_threshold_count(mut self, count: u32) -> Self {
        self.low_use_consequent_threshold_count = count.max(1);
        self
    }

    /// Consecutive checks above the upper bound needed before reporting.
    pub fn high_use_consequent_threshold_count(&self) -> u32 {
        self.high_use_consequent_threshold_count
    }

    /// Set consecutive checks above the upper bound needed before reporting.
    ///
    /// Only used by [`BandwidthScaler`][crate::BandwidthScaler]. Defaults to 2.
    pub fn set_high_use_consequent_threshold_count(mut self, count: u32) -> Self {
        self.high_use_consequent_threshold_count = count.max(1);
        self
    }

    /// Per millisecond decay of the bitrate filter.
    pub fn filter_alpha(&self) -> f64 {
        self.filter_alpha
    }

    /// Set the per millisecond decay of the bitrate filter.
    ///
    /// Only used by [`BandwidthScaler`][crate::BandwidthScaler]. Defaults to 0.9995,
    /// which is a time constant of roughly 2 seconds.
    ///
    /// Panics if alpha is not in `(0, 1)`.
    pub fn set_filter_alpha(mut self, alpha: f64) -> Self {
        assert!(alpha > 0.0 && alpha < 1.0, "filter alpha must be in (0, 1)");
        self.filter_alpha = alpha;
        self
    }

    /// Check the config holds values the setters would accept.
    pub fn validate(&self) -> Result<(), ScalerError> {
        if self.check_interval < MIN_CHECK_INTERVAL {
            return Err(ScalerError::InvalidOptions("check interval too short"));
        }
        if self.low_use_consequent_threshold_count == 0
            || self.high_use_consequent_threshold_count == 0
        {
            return Err(ScalerError::InvalidOptions("consequent threshold count must be positive"));
        }
        if !(self.filter_alpha > 0.0 && self.filter_alpha < 1.0) {
            return Err(ScalerError::InvalidOptions("filter alpha must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Serialized form of [`ScalerConfig`], checked before it is accepted.
#[derive(Deserialize)]
struct ConfigFields {
    check_interval: Duration,
    codec: VideoCodec,
    low_use_consequent_threshold_count: u32,
    high_use_consequent_threshold_count: u32,
    filter_alpha: f64,
}

impl TryFrom<ConfigFields> for ScalerConfig {
    type Error = ScalerError;

    fn try_from(f: ConfigFields) -> Result<Self, Self::Error> {
        let config = ScalerConfig {
            check_interval: f.check_interval,
            codec: f.codec,
            low_use_consequent_threshold_count: f.low_use_consequent_threshold_count,
            high_use_consequent_threshold_count: f.high_use_consequent_threshold_count,
            filter_alpha: f.filter_alpha,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            codec: VideoCodec::default(),
            low_use_consequent_threshold_count: DEFAULT_CONSEQUENT_THRESHOLD_COUNT,
            high_use_consequent_threshold_count: DEFAULT_CONSEQUENT_THRESHOLD_COUNT,
            filter_alpha: DEFAULT_FILTER_ALPHA,
        }
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u32, ScalerError> {
    match value.trim().parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ScalerError::FieldTrial(format!("{key} must be a positive integer: {value}"))),
    }
}

/// Options for the CPU overuse detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuOveruseOptions {
    /// Encode usage at or below which we try to adapt up.
    pub low_encode_usage_threshold_percent: u32,
    /// Encode usage at or above which we adapt down.
    pub high_encode_usage_threshold_percent: u32,
    /// Time without captured frames after which the measurement restarts.
    pub frame_timeout_interval: Duration,
    /// Number of initial checks to skip.
    pub min_process_count: u32,
    /// Consecutive checks above the high threshold needed to report overuse.
    pub high_threshold_consecutive_count: u32,
    /// Time constant of the usage filter.
    pub filter_time: Duration,
    /// Toggles simulated overuse, for manual testing.
    pub simulated_overuse: Option<SimulatedOveruse>,
}

impl CpuOveruseOptions {
    /// Options with the given high threshold, the low threshold set to just under half of it.
    ///
    /// The interval is made 2x+epsilon wide since scaling steps are close to
    /// that when squared, so that one step doesn't jump across it.
    pub fn with_high_threshold(high_encode_usage_threshold_percent: u32) -> Self {
        CpuOveruseOptions {
            low_encode_usage_threshold_percent: high_encode_usage_threshold_percent.saturating_sub(1) / 2,
            high_encode_usage_threshold_percent,
            ..Default::default()
        }
    }

    /// Check the options are usable by the detector.
    pub fn validate(&self) -> Result<(), ScalerError> {
        if self.filter_time.is_zero() {
            return Err(ScalerError::InvalidOptions("filter time must be positive"));
        }
        if self.low_encode_usage_threshold_percent > self.high_encode_usage_threshold_percent {
            return Err(ScalerError::InvalidOptions("low threshold above high threshold"));
        }
        Ok(())
    }
}

impl Default for CpuOveruseOptions {
    fn default() -> Self {
        Self {
            low_encode_usage_threshold_percent: (85 - 1) / 2,
            high_encode_usage_threshold_percent: 85,
            frame_timeout_interval: Duration::from_millis(1500),
            min_process_count: 3,
            high_threshold_consecutive_count: 2,
            filter_time: Duration::from_secs(5),
            simulated_overuse: None,
        }
    }
}

/// Periods for cycling through normal, overuse and underuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedOveruse {
    /// Time spent reporting real measurements.
    pub normal_period: Duration,
    /// Time spent reporting overuse.
    pub overuse_period: Duration,
    /// Time spent reporting underuse.
    pub underuse_period: Duration,
}

impl SimulatedOveruse {
    /// Parse `normal-overuse-underuse` in milliseconds, such as `"30000-10000-20000"`.
    pub fn parse(s: &str) -> Result<Self, ScalerError> {
        let periods: Vec<&str> = s.trim().split('-').collect();
        let [normal, overuse, underuse] = periods[..] else {
            return Err(ScalerError::FieldTrial(format!("malformed toggling interval: {s}")));
        };

        let period = |v: &str| -> Result<Duration, ScalerError> {
            match v.parse::<u64>() {
                Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
                _ => Err(ScalerError::FieldTrial(format!("non-positive toggling period: {s}"))),
            }
        };

        Ok(SimulatedOveruse {
            normal_period: period(normal)?,
            overuse_period: period(overuse)?,
            underuse_period: period(underuse)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let c = ScalerConfig::default();
        assert_eq!(c.check_interval(), Duration::from_secs(5));
        assert_eq!(c.codec(), VideoCodec::H264);
        assert_eq!(c.low_use_consequent_threshold_count(), 2);
        assert_eq!(c.high_use_consequent_threshold_count(), 2);
    }

    #[test]
    fn field_trial_full_string() {
        let c = ScalerConfig::from_field_trial(
            "WebRTC-Video-BandwidthScalerSettings/bitrate_state_update_interval:2/",
        )
        .unwrap();
        assert_eq!(c.check_interval(), Duration::from_secs(2));
    }

    #[test]
    fn field_trial_bare_params() {
        let c = ScalerConfig::from_field_trial(
            "bitrate_state_update_interval:1,high_use_consequent_threshold_count:3,unknown:7",
        )
        .unwrap();
        assert_eq!(c.check_interval(), Duration::from_secs(1));
        assert_eq!(c.high_use_consequent_threshold_count(), 3);
        assert_eq!(c.low_use_consequent_threshold_count(), 2);
    }

    #[test]
    fn field_trial_empty_is_default() {
        assert_eq!(ScalerConfig::from_field_trial("").unwrap(), ScalerConfig::default());
    }

    #[test]
    fn field_trial_rejects_bad_values() {
        for bad in [
            "bitrate_state_update_interval:0",
            "bitrate_state_update_interval:-1",
            "bitrate_state_update_interval:abc",
            "bitrate_state_update_interval",
        ] {
            let err = ScalerConfig::from_field_trial(bad).unwrap_err();
            assert!(matches!(err, ScalerError::FieldTrial(_)), "{bad}");
        }
    }

    #[test]
    fn cpu_options_default_thresholds() {
        let o = CpuOveruseOptions::default();
        assert_eq!(o.high_encode_usage_threshold_percent, 85);
        assert_eq!(o.low_encode_usage_threshold_percent, 42);
        o.validate().unwrap();

        let o = CpuOveruseOptions::with_high_threshold(40);
        assert_eq!(o.low_encode_usage_threshold_percent, 19);
    }

    #[test]
    fn cpu_options_validate() {
        let o = CpuOveruseOptions {
            filter_time: Duration::ZERO,
            ..Default::default()
        };
        assert!(o.validate().is_err());

        let o = CpuOveruseOptions {
            low_encode_usage_threshold_percent: 90,
            ..Default::default()
        };
        assert!(o.validate().is_err());
    }

    #[test]
    fn simulated_overuse_parse() {
        let s = SimulatedOveruse::parse("30000-10000-20000").unwrap();
        assert_eq!(s.normal_period, Duration::from_secs(30));
        assert_eq!(s.overuse_period, Duration::from_secs(10));
        assert_eq!(s.underuse_period, Duration::from_secs(20));

        assert!(SimulatedOveruse::parse("1-2").is_err());
        assert!(SimulatedOveruse::parse("1-0-2").is_err());
        assert!(SimulatedOveruse::parse("a-b-c").is_err());
    }

    #[test]
    fn config_serde() {
        let c = ScalerConfig::new().set_codec(VideoCodec::Vp9);
        let json = serde_json::to_string(&c).unwrap();
        let back: ScalerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn config_deserialize_rejects_what_setters_refuse() {
        let json = |interval_ms: u64, low: u32, high: u32, alpha: f64| {
            format!(
                r#"{{"check_interval":{{"secs":0,"nanos":{}}},"codec":"H264",
                "low_use_consequent_threshold_count":{low},
                "high_use_consequent_threshold_count":{high},
                "filter_alpha":{alpha}}}"#,
                interval_ms * 1_000_000
            )
        };

        let ok: ScalerConfig = serde_json::from_str(&json(2, 1, 3, 0.5)).unwrap();
        assert_eq!(ok.check_interval(), Duration::from_millis(2));
        assert_eq!(ok.high_use_consequent_threshold_count(), 3);

        for bad in [
            json(1, 2, 2, 0.9995),
            json(0, 2, 2, 0.9995),
            json(5000, 0, 2, 0.9995),
            json(5000, 2, 0, 0.9995),
            json(5000, 2, 2, 1.5),
            json(5000, 2, 2, 0.0),
        ] {
            assert!(serde_json::from_str::<ScalerConfig>(&bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn validate_defaults_and_setters() {
        ScalerConfig::default().validate().unwrap();
        ScalerConfig::new()
            .set_check_interval(Duration::from_millis(2))
            .set_low_use_consequent_threshold_count(0)
            .set_filter_alpha(0.5)
            .validate()
            .unwrap();
    }
}
