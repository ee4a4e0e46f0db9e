use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::units::{Bitrate, DataSize};

/// Resolution of the active window. A window that is only a single unit wide
/// can not produce a meaningful rate.
const RESOLUTION: Duration = Duration::from_millis(1);

/// Sliding window bitrate estimator.
///
/// Samples of `(size, time)` are accumulated in a trailing window. The rate is
/// the accumulated size divided by the active window, which is the full
/// window once enough time has passed since the first sample, and the time
/// since the first sample before that.
///
/// Note: time should always monotonically increase in subsequent calls to
/// [`RateStatistics::update`].
#[derive(Debug)]
pub struct RateStatistics {
    window: Duration,
    samples: VecDeque<(Instant, DataSize)>,
    sum: DataSize,
    /// Time of the very first sample since creation or reset. This is not
    /// purged with the window.
    first: Option<Instant>,
}

impl RateStatistics {
    /// Create an estimator with the given trailing window.
    pub fn new(window: Duration) -> Self {
        assert!(window > RESOLUTION, "window must be larger than 1ms");
        RateStatistics {
            window,
            samples: VecDeque::new(),
            sum: DataSize::ZERO,
            first: None,
        }
    }

    /// Record `size` sent at `now`, evicting samples that fell out of the window.
    pub fn update(&mut self, size: DataSize, now: Instant) {
        if self.first.is_none() {
            self.first = Some(now);
        }
        self.purge_old(now);

        self.sum += size;
        self.samples.push_back((now, size));
    }

    /// Current rate as seen at `now`.
    ///
    /// Returns `None` when there is no sample in the window, when the active
    /// window is too short, or when a single sample is all there is and the
    /// window is not yet full.
    pub fn rate(&self, now: Instant) -> Option<Bitrate> {
        let first = self.first?;

        // Samples that a purge at `now` would remove.
        let stale = self.samples.iter().take_while(|(t, _)| self.is_stale(*t, now));
        let (stale_count, stale_sum) = stale.fold((0, DataSize::ZERO), |(n, s), (_, v)| (n + 1, s + *v));

        let count = self.samples.len() - stale_count;
        let mut sum = self.sum;
        sum -= stale_sum;

        let since_first = now.saturating_duration_since(first);
        let active = if since_first >= self.window {
            self.window
        } else {
            since_first + RESOLUTION
        };

        if count == 0 || active <= RESOLUTION || (count <= 1 && active < self.window) {
            return None;
        }

        Some(sum / active)
    }

    /// Forget all samples, including the time of the first sample.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = DataSize::ZERO;
        self.first = None;
    }

    fn purge_old(&mut self, now: Instant) {
        while let Some((t, v)) = self.samples.front().copied() {
            if !self.is_stale(t, now) {
                break;
            }
            self.sum -= v;
            self.samples.pop_front();
        }
    }

    fn is_stale(&self, t: Instant, now: Instant) -> bool {
        now.saturating_duration_since(t) >= self.window
    }
}
