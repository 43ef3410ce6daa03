use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;
use tracing::warn;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Model {
    /// The quantum of time for the engine. Data gathering and prediction both
    /// run once per cycle. Use an even number. **Measured in seconds**.
    ///
    /// ## Note
    ///
    /// Setting this parameter too low may reduce system performance and
    /// stability.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub cycle: Duration,

    /// Whether the correlation coefficient should be used in the prediction
    /// algorithm. There are arguments both for and against using it.
    /// Currently it's believed that using it results in more accurate
    /// prediction.
    pub usecorrelation: bool,

    /// Minimum sum of the length of the maps of a process before it is
    /// considered for tracking, in bytes.
    ///
    /// ## Note
    ///
    /// Setting this parameter too high makes prefetching less effective,
    /// while setting it too low makes the engine eat quadratically more
    /// resources as it tracks more processes.
    pub minsize: u64,

    /// Predicted-need probability below which an exe's maps are not even
    /// considered for the prefetch plan.
    pub minprob: f64,

    /// The following four factors control how much memory the engine is
    /// allowed to use for prefetching in each cycle. All are percentages
    /// clamped to -100..=100. The budget in kilobytes is:
    ///
    /// ```text
    /// max(0, TOTAL * memtotal + FREE * memfree)
    ///   + CACHED * memcached + BUFFERS * membuffers
    /// ```
    ///
    /// where TOTAL, FREE, CACHED, and BUFFERS are read at runtime from
    /// `/proc/meminfo`.
    pub memtotal: i32,

    /// Percentage of free memory.
    pub memfree: i32,

    /// Percentage of cached memory.
    pub memcached: i32,

    /// Percentage of buffer memory.
    pub membuffers: i32,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(20),
            usecorrelation: true,
            minsize: 2_000_000,
            minprob: 0.05,
            memtotal: -10,
            memfree: 50,
            memcached: 0,
            membuffers: 50,
        }
    }
}

impl Model {
    pub(crate) fn clamp_percentages(&mut self) {
        for (name, value) in [
            ("memtotal", &mut self.memtotal),
            ("memfree", &mut self.memfree),
            ("memcached", &mut self.memcached),
            ("membuffers", &mut self.membuffers),
        ] {
            if !(-100..=100).contains(value) {
                warn!(option = name, value = *value, "clamping to -100..=100");
                *value = (*value).clamp(-100, 100);
            }
        }
        if !(0.0..=1.0).contains(&self.minprob) {
            warn!(value = self.minprob, "clamping minprob to 0..=1");
            self.minprob = self.minprob.clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn clamp_limits_values(
            a in -1000i32..1000,
            b in -1000i32..1000,
            c in -1000i32..1000,
            d in -1000i32..1000,
        ) {
            let mut model = Model {
                memtotal: a,
                memfree: b,
                memcached: c,
                membuffers: d,
                ..Default::default()
            };
            model.clamp_percentages();
            prop_assert!((-100..=100).contains(&model.memtotal));
            prop_assert!((-100..=100).contains(&model.memfree));
            prop_assert!((-100..=100).contains(&model.memcached));
            prop_assert!((-100..=100).contains(&model.membuffers));
        }
    }
}
