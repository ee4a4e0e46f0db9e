use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::{CpuOveruseOptions, SimulatedOveruse};

/// Frames older than this are no longer tracked per capture time.
const MAX_FRAME_AGE: Duration = Duration::from_secs(2);

/// Usage reported while simulating overuse.
const SIMULATED_OVERUSE_PERCENT: u32 = 250;

/// Usage reported while simulating underuse.
const SIMULATED_UNDERUSE_PERCENT: u32 = 5;

/// Estimate of the share of time spent encoding.
pub(crate) trait ProcessingUsage: Send {
    fn reset(&mut self);

    /// Register an encoded frame. Returns the encode duration to report, if any.
    fn frame_sent(
        &mut self,
        capture_time: Instant,
        encode_duration: Option<Duration>,
    ) -> Option<Duration>;

    /// Usage in percent.
    fn value(&mut self, now: Instant) -> u32;
}

pub(crate) fn create_processing_usage(options: &CpuOveruseOptions) -> Box<dyn ProcessingUsage> {
    let usage = Box::new(SendProcessingUsage::new(options.clone()));

    match options.simulated_overuse {
        Some(periods) => {
            info!(
                "Simulating overuse with intervals {:?} normal mode, {:?} overuse mode",
                periods.normal_period, periods.overuse_period
            );
            Box::new(OverdoseInjector::new(usage, periods))
        }
        None => usage,
    }
}

/// Send side processing usage: roughly the average encode time of a frame
/// divided by the average time between captured frames.
pub(crate) struct SendProcessingUsage {
    options: CpuOveruseOptions,
    /// Max encode time seen per capture time (used as frame id).
    max_encode_time_per_input_frame: BTreeMap<Instant, Duration>,
    prev_time: Option<Instant>,
    load_estimate: f64,
}

impl SendProcessingUsage {
    pub(crate) fn new(options: CpuOveruseOptions) -> Self {
        let mut usage = SendProcessingUsage {
            options,
            max_encode_time_per_input_frame: BTreeMap::new(),
            prev_time: None,
            load_estimate: 0.0,
        };
        usage.reset();
        usage
    }

    /// Filter update
    ///
    /// load <-- x/d (1 - exp(-d/T)) + exp(-d/T) load
    ///
    /// For small d the limit (1 - exp(-d/T)) / d = 1/T - d/2T^2 + O(d^2) is used.
    fn add_sample(&mut self, encode_time: f64, diff_time: f64) {
        debug_assert!(diff_time >= 0.0);

        let tau = self.options.filter_time.as_secs_f64();
        let e = diff_time / tau;
        let c = if e < 0.0001 {
            (1.0 - e / 2.0) / tau
        } else {
            -(-e).exp_m1() / diff_time
        };

        self.load_estimate = c * encode_time + (-e).exp() * self.load_estimate;
    }

    /// Encode time attributed to one input frame. Simulcast layers encoding the
    /// same input frame count as done in parallel, so only the increase over the
    /// longest layer so far is added.
    fn duration_per_input_frame(&mut self, capture_time: Instant, encode_time: Duration) -> Duration {
        let frames = &mut self.max_encode_time_per_input_frame;

        while let Some((&t, _)) = frames.first_key_value() {
            if capture_time.saturating_duration_since(t) <= MAX_FRAME_AGE {
                break;
            }
            frames.pop_first();
        }

        match frames.entry(capture_time) {
            Entry::Vacant(v) => {
                v.insert(encode_time);
                encode_time
            }
            Entry::Occupied(mut o) => {
                let max = o.get_mut();
                if encode_time <= *max {
                    Duration::ZERO
                } else {
                    let increase = encode_time - *max;
                    *max = encode_time;
                    increase
                }
            }
        }
    }
}

impl ProcessingUsage for SendProcessingUsage {
    fn reset(&mut self) {
        self.prev_time = None;
        // Start in between the underuse and overuse threshold.
        self.load_estimate = (self.options.low_encode_usage_threshold_percent
            + self.options.high_encode_usage_threshold_percent) as f64
            / 200.0;
    }

    fn frame_sent(
        &mut self,
        capture_time: Instant,
        encode_duration: Option<Duration>,
    ) -> Option<Duration> {
        let mut capture_time = capture_time;

        if let Some(encode) = encode_duration {
            let per_frame = self.duration_per_input_frame(capture_time, encode);

            if let Some(prev) = self.prev_time {
                // Late frames are pushed forward in time, the filter weighs
                // samples assuming non-decreasing times.
                capture_time = capture_time.max(prev);
                let diff = capture_time - prev;
                self.add_sample(per_frame.as_secs_f64(), diff.as_secs_f64());
            }
        }
        self.prev_time = Some(capture_time);

        encode_duration
    }

    fn value(&mut self, _now: Instant) -> u32 {
        (100.0 * self.load_estimate + 0.5) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectorState {
    Normal,
    Overuse,
    Underuse,
}

/// Cycles between real measurements, overuse and underuse, for manual testing.
pub(crate) struct OverdoseInjector {
    usage: Box<dyn ProcessingUsage>,
    periods: SimulatedOveruse,
    state: InjectorState,
    last_toggling: Option<Instant>,
}

impl OverdoseInjector {
    pub(crate) fn new(usage: Box<dyn ProcessingUsage>, periods: SimulatedOveruse) -> Self {
        OverdoseInjector {
            usage,
            periods,
            state: InjectorState::Normal,
            last_toggling: None,
        }
    }

    fn toggle(&mut self, now: Instant) {
        let Some(last) = self.last_toggling else {
            self.last_toggling = Some(now);
            return;
        };
        let since = now.saturating_duration_since(last);

        let next = match self.state {
            InjectorState::Normal if since > self.periods.normal_period => InjectorState::Overuse,
            InjectorState::Overuse if since > self.periods.overuse_period => InjectorState::Underuse,
            InjectorState::Underuse if since > self.periods.underuse_period => InjectorState::Normal,
            _ => return,
        };

        match next {
            InjectorState::Overuse => info!("Simulating CPU overuse"),
            InjectorState::Underuse => info!("Simulating CPU underuse"),
            InjectorState::Normal => info!("Actual CPU overuse measurements in effect"),
        }
        self.state = next;
        self.last_toggling = Some(now);
    }
}

impl ProcessingUsage for OverdoseInjector {
    fn reset(&mut self) {
        self.usage.reset();
    }

    fn frame_sent(
        &mut self,
        capture_time: Instant,
        encode_duration: Option<Duration>,
    ) -> Option<Duration> {
        self.usage.frame_sent(capture_time, encode_duration)
    }

    fn value(&mut self, now: Instant) -> u32 {
        self.toggle(now);

        match self.state {
            InjectorState::Normal => self.usage.value(now),
            InjectorState::Overuse => SIMULATED_OVERUSE_PERCENT,
            InjectorState::Underuse => SIMULATED_UNDERUSE_PERCENT,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FRAME_INTERVAL: Duration = Duration::from_millis(33);

    fn send_frames(
        usage: &mut dyn ProcessingUsage,
        start: Instant,
        count: u32,
        encode: Duration,
    ) -> Instant {
        let mut t = start;
        for _ in 0..count {
            usage.frame_sent(t, Some(encode));
            t += FRAME_INTERVAL;
        }
        t
    }

    #[test]
    fn initial_usage_is_between_thresholds() {
        let mut usage = SendProcessingUsage::new(CpuOveruseOptions::default());
        // (42 + 85) / 2 rounded.
        assert_eq!(usage.value(Instant::now()), 64);
    }

    #[test]
    fn converges_to_encode_share() {
        let mut usage = SendProcessingUsage::new(CpuOveruseOptions::default());
        let now = Instant::now();

        // 5ms of 33ms is ~15%.
        let t = send_frames(&mut usage, now, 1000, Duration::from_millis(5));
        assert_eq!(usage.value(t), 15);

        // 32ms of 33ms is ~97%.
        let t = send_frames(&mut usage, t, 1000, Duration::from_millis(32));
        assert_eq!(usage.value(t), 97);
    }

    #[test]
    fn parallel_layers_count_once() {
        let mut usage = SendProcessingUsage::new(CpuOveruseOptions::default());
        let now = Instant::now();

        assert_eq!(usage.duration_per_input_frame(now, Duration::from_millis(10)), Duration::from_millis(10));
        assert_eq!(usage.duration_per_input_frame(now, Duration::from_millis(8)), Duration::ZERO);
        assert_eq!(usage.duration_per_input_frame(now, Duration::from_millis(15)), Duration::from_millis(5));
    }

    #[test]
    fn old_frames_are_discarded() {
        let mut usage = SendProcessingUsage::new(CpuOveruseOptions::default());
        let now = Instant::now();

        usage.duration_per_input_frame(now, Duration::from_millis(10));
        usage.duration_per_input_frame(now + Duration::from_secs(3), Duration::from_millis(10));
        assert_eq!(usage.max_encode_time_per_input_frame.len(), 1);
    }

    #[test]
    fn late_frame_is_clamped() {
        let mut usage = SendProcessingUsage::new(CpuOveruseOptions::default());
        let now = Instant::now();

        usage.frame_sent(now + Duration::from_millis(100), Some(Duration::from_millis(5)));
        usage.frame_sent(now, Some(Duration::from_millis(5)));
        assert_eq!(usage.prev_time, Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn injector_cycles() {
        let periods = SimulatedOveruse {
            normal_period: Duration::from_secs(10),
            overuse_period: Duration::from_secs(5),
            underuse_period: Duration::from_secs(5),
        };
        let inner = Box::new(SendProcessingUsage::new(CpuOveruseOptions::default()));
        let mut usage = OverdoseInjector::new(inner, periods);
        let now = Instant::now();
        let at = |s: u64| now + Duration::from_secs(s);

        assert_eq!(usage.value(at(0)), 64);
        assert_eq!(usage.value(at(10)), 64);
        assert_eq!(usage.value(at(11)), 250);
        assert_eq!(usage.value(at(17)), 5);
        assert_eq!(usage.value(at(23)), 64);
    }
}
