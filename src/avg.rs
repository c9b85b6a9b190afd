use std::{convert::TryInto, time::Duration};

/// This is an exponential moving average accumulator.
///
/// An algorithm is used that addresses the initial bias that occurs when all
/// values are initialized with zero or with the first sample (which would bias
/// the average toward the first value). This is achieved by initially giving
/// a low gain for the average and slowly increasing it until the inverted gain
/// is reached.
///
/// For example, the first sample should have a gain of 1 as the average has no
/// meaning. When adding the second sample, the average has some meaning, but
/// since it only has one sample in it, the gain should be low. In the next
/// round however, the gain may be larger. This increase is repeated until
/// inverted gain is reached. This way, even early samples have a reasonable
/// impact on the average, which is important in a torrent app.
///
/// Ported from libtorrent: https://blog.libtorrent.org/2014/09/running-averages/
#[derive(Debug)]
pub struct SlidingAvg {
    /// The current running average, effectively the mean.
    ///
    /// This is a fixed-point value, that is, the sample is multiplied by 64
    /// before adding it. When the mean is returned, 32 is added and the sum is
    /// divided back by 64, to eliminate integer truncation that would result
    /// in a bias.
    mean: i64,
    /// The average deviation, in the same fixed-point representation.
    deviation: i64,
    /// The number of samples received, but no more than `inverted_gain`.
    sample_count: usize,
    /// This is the threshold used for determining how many initial samples to
    /// give a higher gain than the current average. Once `sample_count`
    /// reaches this, the steady-state gain is `1 / inverted_gain`.
    inverted_gain: usize,
}

impl SlidingAvg {
    pub fn new(inverted_gain: usize) -> Self {
        debug_assert!(inverted_gain > 0);
        Self {
            mean: 0,
            deviation: 0,
            sample_count: 0,
            inverted_gain,
        }
    }

    pub fn update(&mut self, sample: u64) {
        // see comment in `Self::mean`
        let sample = sample as i64 * 64;

        let deviation = if self.sample_count > 0 {
            (self.mean - sample).abs()
        } else {
            0
        };

        if self.sample_count < self.inverted_gain {
            self.sample_count += 1;
        }

        self.mean += (sample - self.mean) / self.sample_count as i64;

        if self.sample_count > 1 {
            self.deviation +=
                (deviation - self.deviation) / (self.sample_count - 1) as i64;
        }
    }

    pub fn mean(&self) -> u64 {
        if self.sample_count == 0 {
            0
        } else {
            ((self.mean + 32) / 64).max(0) as u64
        }
    }

    pub fn deviation(&self) -> u64 {
        if self.sample_count == 0 {
            0
        } else {
            ((self.deviation + 32) / 64).max(0) as u64
        }
    }
}

impl Default for SlidingAvg {
    /// Creates a sliding average with an inverted gain of 20.
    fn default() -> Self {
        Self::new(20)
    }
}

/// Wraps a [`SlidingAvg`] instance and converts the statistics to
/// [`std::time::Duration`] units (keeping everything in the underlying layer
/// as milliseconds).
#[derive(Debug)]
pub struct SlidingDurationAvg(SlidingAvg);

impl SlidingDurationAvg {
    pub fn new(inverted_gain: usize) -> Self {
        Self(SlidingAvg::new(inverted_gain))
    }

    pub fn update(&mut self, sample: Duration) {
        let ms = sample.as_millis().try_into().unwrap_or(u64::MAX);
        self.0.update(ms);
    }

    pub fn mean(&self) -> Duration {
        Duration::from_millis(self.0.mean())
    }

    #[allow(dead_code)]
    pub fn deviation(&self) -> Duration {
        Duration::from_millis(self.0.deviation())
    }
}

impl Default for SlidingDurationAvg {
    /// Creates a sliding average with an inverted gain of 20.
    fn default() -> Self {
        Self(SlidingAvg::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The first sample must land on the average exactly, regardless of the
    // configured gain.
    #[test]
    fn test_first_sample_is_mean() {
        let mut avg = SlidingAvg::new(8);
        avg.update(1000);
        assert_eq!(avg.mean(), 1000);
        assert_eq!(avg.deviation(), 0);
    }

    // With an inverted gain of 8 the steady-state update is
    // mean += (sample - mean) / 8, i.e. an EWMA with a gain of 1/8.
    #[test]
    fn test_steady_state_gain() {
        let mut avg = SlidingAvg::new(8);
        for _ in 0..8 {
            avg.update(800);
        }
        assert_eq!(avg.mean(), 800);

        avg.update(1600);
        // 800 + (1600 - 800) / 8 = 900
        assert_eq!(avg.mean(), 900);
    }

    // A constant stream of samples must not drift.
    #[test]
    fn test_constant_samples() {
        let mut avg = SlidingDurationAvg::new(8);
        for _ in 0..32 {
            avg.update(Duration::from_millis(250));
        }
        assert_eq!(avg.mean(), Duration::from_millis(250));
    }
}
