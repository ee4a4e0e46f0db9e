/// Single pole exponential filter.
///
/// Each update weighs the previous value with `alpha^exp` and the new sample
/// with `1 - alpha^exp`, where `exp` is typically the elapsed time in some unit
/// (for example milliseconds) since the previous sample. The closer `alpha` is
/// to 1, the longer the memory.
#[derive(Debug, Clone)]
pub struct ExpFilter {
    alpha: f64,
    filtered: Option<f64>,
}

impl ExpFilter {
    /// Create an empty filter with the given decay.
    pub fn new(alpha: f64) -> Self {
        ExpFilter {
            alpha,
            filtered: None,
        }
    }

    /// Clear the filter to "no value yet" and set a new decay.
    pub fn reset(&mut self, alpha: f64) {
        self.alpha = alpha;
        self.filtered = None;
    }

    /// Apply `sample` with the decay raised to `exp`. The first sample is taken as is.
    pub fn apply(&mut self, exp: f64, sample: f64) -> f64 {
        let value = match self.filtered {
            None => sample,
            Some(prev) => {
                let alpha = if exp == 1.0 {
                    self.alpha
                } else {
                    self.alpha.powf(exp)
                };
                alpha * prev + (1.0 - alpha) * sample
            }
        };

        self.filtered = Some(value);
        value
    }

    /// Current value, `None` before the first sample.
    pub fn filtered(&self) -> Option<f64> {
        self.filtered
    }
}
