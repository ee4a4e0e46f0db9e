use std::time::{Duration, Instant};

use super::usage::{create_processing_usage, ProcessingUsage};
use super::{AdaptReason, OveruseDetector, OveruseObserver};
use crate::config::CpuOveruseOptions;
use crate::ScalerError;

const CHECK_FOR_OVERUSE_INTERVAL: Duration = Duration::from_millis(5000);
const TIME_TO_FIRST_CHECK_FOR_OVERUSE: Duration = Duration::from_millis(100);

/// Delay between consecutive rampups, for quick recovery.
const QUICK_RAMPUP_DELAY: Duration = Duration::from_secs(10);
/// Delay between rampup attempts. Starts at standard, backs off up to max.
const STANDARD_RAMPUP_DELAY: Duration = Duration::from_secs(40);
const MAX_RAMPUP_DELAY: Duration = Duration::from_secs(240);
const RAMPUP_BACKOFF_FACTOR: u32 = 2;

/// Overuses after which the rampup delay always applies.
const MAX_OVERUSES_BEFORE_APPLY_RAMPUP_DELAY: u32 = 4;

/// Overuse detector measuring encode time against capture interval.
pub struct OveruseFrameDetector {
    options: CpuOveruseOptions,
    usage: Box<dyn ProcessingUsage>,
    encode_usage_percent: Option<u32>,

    /// Checks done since the last reset.
    num_process_times: u32,
    last_capture_time: Option<Instant>,
    /// Frame size of the current measurement. `None` forces a reset on the next frame.
    num_pixels: Option<u32>,

    last_overuse_time: Option<Instant>,
    checks_above_threshold: u32,
    num_overuse_detections: u32,
    last_rampup_time: Option<Instant>,
    in_quick_rampup: bool,
    current_rampup_delay: Duration,

    next_check: Option<Instant>,
}

impl OveruseFrameDetector {
    /// Create a detector. No checks run until started.
    pub fn new() -> Self {
        let options = CpuOveruseOptions::default();
        OveruseFrameDetector {
            usage: create_processing_usage(&options),
            options,
            encode_usage_percent: None,
            num_process_times: 0,
            last_capture_time: None,
            num_pixels: None,
            last_overuse_time: None,
            checks_above_threshold: 0,
            num_overuse_detections: 0,
            last_rampup_time: None,
            in_quick_rampup: false,
            current_rampup_delay: STANDARD_RAMPUP_DELAY,
            next_check: None,
        }
    }

    /// The latest encode usage estimate in percent.
    pub fn encode_usage_percent(&self) -> Option<u32> {
        self.encode_usage_percent
    }

    fn set_options(&mut self, options: CpuOveruseOptions) -> Result<(), ScalerError> {
        options.validate()?;
        self.usage = create_processing_usage(&options);
        self.options = options;
        self.num_pixels = None;
        Ok(())
    }

    fn frame_size_changed(&self, num_pixels: u32) -> bool {
        self.num_pixels != Some(num_pixels)
    }

    fn frame_timeout_detected(&self, now: Instant) -> bool {
        let Some(last) = self.last_capture_time else {
            return false;
        };
        now.saturating_duration_since(last) > self.options.frame_timeout_interval
    }

    /// Restart the measurement, but keep the rampup state.
    fn reset_all(&mut self, num_pixels: u32) {
        self.num_pixels = Some(num_pixels);
        self.usage.reset();
        self.last_capture_time = None;
        self.num_process_times = 0;
        self.encode_usage_percent = None;
    }

    fn is_overusing(&mut self, usage_percent: u32) -> bool {
        if usage_percent >= self.options.high_encode_usage_threshold_percent {
            self.checks_above_threshold += 1;
        } else {
            self.checks_above_threshold = 0;
        }
        self.checks_above_threshold >= self.options.high_threshold_consecutive_count
    }

    fn is_underusing(&self, usage_percent: u32, now: Instant) -> bool {
        if let Some(last) = self.last_rampup_time {
            if now < last + self.rampup_delay() {
                return false;
            }
        }
        usage_percent < self.options.low_encode_usage_threshold_percent
    }

    fn rampup_delay(&self) -> Duration {
        if self.in_quick_rampup {
            QUICK_RAMPUP_DELAY
        } else {
            self.current_rampup_delay
        }
    }

    /// Returns `true` if the observer wants checks to run more often.
    fn check_for_overuse(&mut self, now: Instant, observer: &mut dyn OveruseObserver) -> bool {
        self.num_process_times += 1;
        if self.num_process_times <= self.options.min_process_count {
            return false;
        }
        let Some(usage_percent) = self.encode_usage_percent else {
            return false;
        };

        let mut increase_frequency = false;

        if self.is_overusing(usage_percent) {
            // Going down right after going up means the peak was short. Back
            // off to avoid flapping at a load the system can't handle.
            let check_for_backoff = self.last_rampup_time > self.last_overuse_time;
            if check_for_backoff {
                let since_rampup = self
                    .last_rampup_time
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();

                if since_rampup < STANDARD_RAMPUP_DELAY
                    || self.num_overuse_detections > MAX_OVERUSES_BEFORE_APPLY_RAMPUP_DELAY
                {
                    self.current_rampup_delay =
                        (self.current_rampup_delay * RAMPUP_BACKOFF_FACTOR).min(MAX_RAMPUP_DELAY);
                } else {
                    self.current_rampup_delay = STANDARD_RAMPUP_DELAY;
                }
            }

            self.last_overuse_time = Some(now);
            self.in_quick_rampup = false;
            self.checks_above_threshold = 0;
            self.num_overuse_detections += 1;

            debug!("CPU overuse at {}%", usage_percent);
            increase_frequency = observer.adapt_down(AdaptReason::Cpu);
        } else if self.is_underusing(usage_percent, now) {
            self.last_rampup_time = Some(now);
            self.in_quick_rampup = true;

            debug!("CPU underuse at {}%", usage_percent);
            observer.adapt_up(AdaptReason::Cpu);
        }

        trace!(
            "Frame stats: encode usage {} overuse detections {} rampup delay {:?}",
            usage_percent,
            self.num_overuse_detections,
            self.rampup_delay()
        );

        increase_frequency
    }
}

impl Default for OveruseFrameDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl OveruseDetector for OveruseFrameDetector {
    fn start_check_for_overuse(
        &mut self,
        options: CpuOveruseOptions,
        now: Instant,
    ) -> Result<(), ScalerError> {
        debug_assert!(self.next_check.is_none(), "OveruseFrameDetector already started");
        self.set_options(options)?;
        self.next_check = Some(now + TIME_TO_FIRST_CHECK_FOR_OVERUSE);
        Ok(())
    }

    fn stop_check_for_overuse(&mut self) {
        self.next_check = None;
    }

    fn frame_captured(&mut self, frame_size_pixels: u32, time: Instant) {
        if self.frame_size_changed(frame_size_pixels) || self.frame_timeout_detected(time) {
            trace!("Reset overuse measurement for {} px", frame_size_pixels);
            self.reset_all(frame_size_pixels);
        }
        self.last_capture_time = Some(time);
    }

    fn frame_sent(
        &mut self,
        capture_time: Instant,
        encode_duration: Option<Duration>,
        now: Instant,
    ) {
        if self.usage.frame_sent(capture_time, encode_duration).is_some() {
            self.encode_usage_percent = Some(self.usage.value(now));
        }
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.next_check
    }

    fn handle_timeout(&mut self, now: Instant, observer: &mut dyn OveruseObserver) {
        let Some(next) = self.next_check else {
            return;
        };
        if now < next {
            return;
        }

        let interval = if self.check_for_overuse(now, observer) {
            CHECK_FOR_OVERUSE_INTERVAL / 2
        } else {
            CHECK_FOR_OVERUSE_INTERVAL
        };
        self.next_check = Some(now + interval);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FRAME_INTERVAL: Duration = Duration::from_millis(33);
    const PROCESS_TIME: Duration = Duration::from_millis(5);

    #[derive(Default)]
    struct Observer {
        up: usize,
        down: usize,
        increase_frequency: bool,
    }

    impl OveruseObserver for Observer {
        fn adapt_up(&mut self, reason: AdaptReason) {
            assert_eq!(reason, AdaptReason::Cpu);
            self.up += 1;
        }

        fn adapt_down(&mut self, reason: AdaptReason) -> bool {
            assert_eq!(reason, AdaptReason::Cpu);
            self.down += 1;
            self.increase_frequency
        }
    }

    struct Fixture {
        detector: OveruseFrameDetector,
        observer: Observer,
        now: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_options(CpuOveruseOptions {
                min_process_count: 0,
                ..Default::default()
            })
        }

        fn with_options(options: CpuOveruseOptions) -> Self {
            let mut detector = OveruseFrameDetector::new();
            detector.set_options(options).unwrap();
            Fixture {
                detector,
                observer: Observer::default(),
                now: Instant::now(),
            }
        }

        fn send_frames(&mut self, count: u32, interval: Duration, encode: Duration) {
            for _ in 0..count {
                self.detector.frame_sent(self.now, Some(encode), self.now);
                self.now += interval;
            }
        }

        fn capture_and_send(&mut self, count: u32, frame_size_pixels: u32, encode: Duration) {
            for _ in 0..count {
                self.detector.frame_captured(frame_size_pixels, self.now);
                self.detector.frame_sent(self.now, Some(encode), self.now);
                self.now += FRAME_INTERVAL;
            }
        }

        fn check(&mut self) {
            self.detector.check_for_overuse(self.now, &mut self.observer);
        }

        fn trigger_overuse(&mut self, times: u32) {
            for _ in 0..times {
                self.send_frames(1000, FRAME_INTERVAL, Duration::from_millis(32));
                self.check();
            }
        }

        fn trigger_underuse(&mut self) {
            self.send_frames(1300, FRAME_INTERVAL, PROCESS_TIME);
            self.send_frames(1, FRAME_INTERVAL, Duration::from_millis(6));
            self.check();
        }
    }

    #[test]
    fn trigger_overuse() {
        let mut f = Fixture::new();
        f.trigger_overuse(2);
        assert_eq!(f.observer.down, 1);
    }

    #[test]
    fn overuse_and_recover() {
        let mut f = Fixture::new();
        f.trigger_overuse(2);
        f.trigger_underuse();
        assert_eq!(f.observer.down, 1);
        assert!(f.observer.up >= 1);
    }

    #[test]
    fn double_overuse_and_recover() {
        let mut f = Fixture::new();
        f.trigger_overuse(2);
        f.trigger_overuse(2);
        f.trigger_underuse();
        assert_eq!(f.observer.down, 2);
        assert!(f.observer.up >= 1);
    }

    #[test]
    fn constant_overuse_gives_no_underuse() {
        let mut f = Fixture::new();
        for _ in 0..16 {
            f.trigger_overuse(2);
        }
        assert_eq!(f.observer.down, 16);
        assert_eq!(f.observer.up, 0);
    }

    #[test]
    fn too_few_consecutive_checks_is_no_overuse() {
        let mut f = Fixture::new();
        f.trigger_overuse(1);
        assert_eq!(f.observer.down, 0);
    }

    #[test]
    fn min_process_count_skips_checks() {
        let mut f = Fixture::with_options(CpuOveruseOptions {
            min_process_count: 1,
            ..Default::default()
        });
        f.send_frames(1200, FRAME_INTERVAL, PROCESS_TIME);
        f.check();
        assert_eq!(f.observer.up, 0);

        f.now += Duration::from_secs(5);
        f.check();
        assert_eq!(f.observer.up, 1);
    }

    #[test]
    fn processing_usage() {
        let mut f = Fixture::new();
        f.send_frames(1000, FRAME_INTERVAL, PROCESS_TIME);
        // 5 * 100 / 33
        assert_eq!(f.detector.encode_usage_percent(), Some(15));
    }

    #[test]
    fn quick_rampup_waits_between_underuses() {
        let mut f = Fixture::new();
        f.trigger_underuse();
        assert_eq!(f.observer.up, 1);

        f.now += Duration::from_secs(5);
        f.check();
        assert_eq!(f.observer.up, 1);

        f.now += Duration::from_secs(5);
        f.check();
        assert_eq!(f.observer.up, 2);
    }

    #[test]
    fn short_rampup_backs_off() {
        let mut f = Fixture::with_options(CpuOveruseOptions {
            min_process_count: 0,
            high_threshold_consecutive_count: 1,
            ..Default::default()
        });
        let heavy = Duration::from_millis(32);

        f.send_frames(600, FRAME_INTERVAL, heavy);
        f.check();
        assert_eq!(f.observer.down, 1);

        f.send_frames(600, FRAME_INTERVAL, PROCESS_TIME);
        f.check();
        assert_eq!(f.observer.up, 1);

        // Overuse again less than 40s after going up.
        f.send_frames(600, FRAME_INTERVAL, heavy);
        f.check();
        assert_eq!(f.observer.down, 2);
        assert_eq!(f.detector.current_rampup_delay, Duration::from_secs(80));

        // 40s after the rampup is not enough anymore.
        f.send_frames(600, FRAME_INTERVAL, PROCESS_TIME);
        f.check();
        assert_eq!(f.observer.up, 1);

        f.send_frames(1300, FRAME_INTERVAL, PROCESS_TIME);
        f.check();
        assert_eq!(f.observer.up, 2);
    }

    #[test]
    fn frame_size_change_resets() {
        let mut f = Fixture::new();
        f.capture_and_send(1000, 640 * 360, PROCESS_TIME);
        assert_eq!(f.detector.encode_usage_percent(), Some(15));

        f.detector.frame_captured(640 * 360, f.now);
        assert_eq!(f.detector.encode_usage_percent(), Some(15));

        f.detector.frame_captured(1280 * 720, f.now);
        assert_eq!(f.detector.encode_usage_percent(), None);

        // No usage, nothing to report.
        f.check();
        assert_eq!((f.observer.up, f.observer.down), (0, 0));

        // Back at the initial estimate.
        f.send_frames(1, Duration::from_secs(1), FRAME_INTERVAL);
        assert_eq!(f.detector.encode_usage_percent(), Some(64));
    }

    #[test]
    fn frame_timeout_resets() {
        let mut f = Fixture::new();
        let px = 640 * 360;
        f.capture_and_send(1000, px, PROCESS_TIME);

        f.detector.frame_captured(px, f.now);
        f.now += Duration::from_millis(1500);
        f.detector.frame_captured(px, f.now);
        assert_eq!(f.detector.encode_usage_percent(), Some(15));

        f.now += Duration::from_millis(1501);
        f.detector.frame_captured(px, f.now);
        assert_eq!(f.detector.encode_usage_percent(), None);
    }

    #[test]
    fn periodic_check_schedule() {
        let mut detector = OveruseFrameDetector::new();
        let mut observer = Observer {
            increase_frequency: true,
            ..Default::default()
        };
        let now = Instant::now();
        assert_eq!(detector.poll_timeout(), None);

        let options = CpuOveruseOptions {
            min_process_count: 0,
            high_threshold_consecutive_count: 1,
            ..Default::default()
        };
        detector.start_check_for_overuse(options, now).unwrap();
        let first = now + Duration::from_millis(100);
        assert_eq!(detector.poll_timeout(), Some(first));

        // Not due yet.
        detector.handle_timeout(now, &mut observer);
        assert_eq!(detector.poll_timeout(), Some(first));

        detector.handle_timeout(first, &mut observer);
        let second = first + Duration::from_secs(5);
        assert_eq!(detector.poll_timeout(), Some(second));

        let mut t = second;
        for _ in 0..1000 {
            detector.frame_sent(t, Some(Duration::from_millis(32)), t);
            t += FRAME_INTERVAL;
        }
        detector.handle_timeout(t, &mut observer);
        assert_eq!(observer.down, 1);
        assert_eq!(detector.poll_timeout(), Some(t + Duration::from_millis(2500)));

        detector.stop_check_for_overuse();
        assert_eq!(detector.poll_timeout(), None);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let mut detector = OveruseFrameDetector::new();
        let options = CpuOveruseOptions {
            filter_time: Duration::ZERO,
            ..Default::default()
        };
        let r = detector.start_check_for_overuse(options, Instant::now());
        assert!(matches!(r, Err(ScalerError::InvalidOptions(_))));
        assert_eq!(detector.poll_timeout(), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already started")]
    fn double_start_panics() {
        let mut detector = OveruseFrameDetector::new();
        let now = Instant::now();
        detector
            .start_check_for_overuse(CpuOveruseOptions::default(), now)
            .unwrap();
        let _ = detector.start_check_for_overuse(CpuOveruseOptions::default(), now);
    }

    #[test]
    fn restart_after_stop() {
        let mut detector = OveruseFrameDetector::new();
        let now = Instant::now();
        detector
            .start_check_for_overuse(CpuOveruseOptions::default(), now)
            .unwrap();
        detector.stop_check_for_overuse();

        let later = now + Duration::from_secs(1);
        detector
            .start_check_for_overuse(CpuOveruseOptions::default(), later)
            .unwrap();
        assert_eq!(
            detector.poll_timeout(),
            Some(later + TIME_TO_FIRST_CHECK_FOR_OVERUSE)
        );
    }
}
