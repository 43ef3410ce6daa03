use super::MarkovState;
use crate::{Error, exe::ExeForMarkov, extract_exe};

#[derive(Debug, Default, Clone)]
pub(crate) struct MarkovInner {
    pub(crate) exe_a: ExeForMarkov,

    pub(crate) exe_b: ExeForMarkov,

    /// Seconds both exes have been running simultaneously (state 3).
    pub(crate) time: u64,

    /// Mean dwell time per state, in seconds.
    pub(crate) time_to_leave: [f64; 4],

    /// `weight[i][j]` counts observed transitions from state i to state j;
    /// `weight[i][i]` is the total number of departures from state i.
    pub(crate) weight: [[u32; 4]; 4],

    pub(crate) state: MarkovState,

    /// Time the chain entered the current state.
    pub(crate) change_timestamp: u64,
}

impl MarkovInner {
    pub(crate) fn new(exe_a: ExeForMarkov, exe_b: ExeForMarkov) -> Self {
        Self {
            exe_a,
            exe_b,
            ..Default::default()
        }
    }

    /// Initialize a chain created mid-run.
    ///
    /// The state is computed from the two exes' running flags, and the
    /// change timestamp is reconstructed as the latest of the participants'
    /// change timestamps that is not in the future. An exe whose own change
    /// is newer than the chosen timestamp had flipped since, so its bit is
    /// toggled back to what the chain would have recorded at that moment.
    pub(crate) fn initialize(
        &mut self,
        state_time: u64,
        last_running_timestamp: u64,
    ) -> Result<(), Error> {
        self.state = MarkovState::from_running(
            extract_exe!(self.exe_a).is_running(last_running_timestamp),
            extract_exe!(self.exe_b).is_running(last_running_timestamp),
        );
        self.change_timestamp = state_time;

        let exe_a_change = extract_exe!(self.exe_a).change_timestamp;
        let exe_b_change = extract_exe!(self.exe_b).change_timestamp;

        if let (Some(a_change), Some(b_change)) = (exe_a_change, exe_b_change) {
            if a_change < state_time {
                self.change_timestamp = a_change;
            }
            if b_change < state_time && b_change > self.change_timestamp {
                self.change_timestamp = b_change;
            }
            if a_change > self.change_timestamp {
                self.state ^= MarkovState::ExeARunning;
            }
            if b_change > self.change_timestamp {
                self.state ^= MarkovState::ExeBRunning;
            }
        }
        self.state_changed(state_time, last_running_timestamp)?;

        Ok(())
    }

    /// Recompute the state directly from the exes' running flags, without
    /// touching the statistics. Used after loading a state file.
    pub(crate) fn set_state(&mut self, last_running_timestamp: u64) -> Result<(), Error> {
        self.state = MarkovState::from_running(
            extract_exe!(self.exe_a).is_running(last_running_timestamp),
            extract_exe!(self.exe_b).is_running(last_running_timestamp),
        );
        Ok(())
    }

    /// Record a state transition at `state_time`.
    ///
    /// Called whenever either participant just flipped its running status.
    /// A second call in the same tick is a no-op. A call where the computed
    /// state equals the stored one can only come from a chain created
    /// earlier in the same cycle that already initialized to the
    /// post-transition state; the timestamp is refreshed and no transition
    /// is recorded.
    pub(crate) fn state_changed(
        &mut self,
        state_time: u64,
        last_running_timestamp: u64,
    ) -> Result<(), Error> {
        if self.change_timestamp == state_time {
            // already taken care of
            return Ok(());
        }

        let old_state = self.state;
        let new_state = MarkovState::from_running(
            extract_exe!(self.exe_a).is_running(last_running_timestamp),
            extract_exe!(self.exe_b).is_running(last_running_timestamp),
        );

        if old_state == new_state {
            self.change_timestamp = state_time;
            return Ok(());
        }

        let old = old_state.index();
        let new = new_state.index();

        self.weight[old][old] += 1;
        self.time_to_leave[old] += ((state_time - self.change_timestamp) as f64
            - self.time_to_leave[old])
            / f64::from(self.weight[old][old]);

        self.weight[old][new] += 1;
        self.state = new_state;
        self.change_timestamp = state_time;

        Ok(())
    }

    /// Pearson correlation of the two running-indicator variables.
    ///
    /// With `t` the total model time, `a`/`b` the exes' running times, and
    /// `ab` the simultaneous running time:
    ///
    /// ```text
    ///              t·ab − a·b
    /// ρ = ──────────────────────────
    ///     √(a·b·(t − a)·(t − b))
    /// ```
    ///
    /// A variable that was constant (never ran, or always ran) has no
    /// correlation and yields 0.
    pub(crate) fn correlation(&self, state_time: u64) -> Result<f64, Error> {
        let t = state_time;
        let a = extract_exe!(self.exe_a).time;
        let b = extract_exe!(self.exe_b).time;
        let ab = self.time;

        let correlation = if a == 0 || a == t || b == 0 || b == t {
            0.0
        } else {
            let numerator = (t as f64 * ab as f64) - (a as f64 * b as f64);
            let denominator2 = (a as f64 * b as f64) * ((t - a) as f64 * (t - b) as f64);
            numerator / denominator2.sqrt()
        };

        if correlation.abs() > 1.000_01 {
            return Err(Error::CorrelationOutOfRange { value: correlation });
        }
        Ok(correlation)
    }

    pub(crate) fn bid_in_exes(
        &self,
        use_correlation: bool,
        state_time: u64,
        cycle: f64,
    ) -> Result<(), Error> {
        let state = self.state.index();
        if self.weight[state][state] == 0 {
            return Ok(());
        }

        // Bids make sense only while exactly one of the pair is running;
        // negative correlations are suppressed, not inverted.
        let correlation = if use_correlation {
            self.correlation(state_time)?.max(0.0)
        } else {
            1.0
        };

        if self.state == MarkovState::ExeARunning {
            self.bid_for_exe(&self.exe_b, MarkovState::ExeBRunning, correlation, cycle)
        } else if self.state == MarkovState::ExeBRunning {
            self.bid_for_exe(&self.exe_a, MarkovState::ExeARunning, correlation, cycle)
        } else {
            Ok(())
        }
    }

    fn bid_for_exe(
        &self,
        exe: &ExeForMarkov,
        ystate: MarkovState,
        correlation: f64,
        cycle: f64,
    ) -> Result<(), Error> {
        let state = self.state.index();
        let ystate = ystate.index();

        if self.weight[state][state] == 0 || self.time_to_leave[state] <= 1.0 {
            return Ok(());
        }

        // p_state_change is the probability of the chain leaving its state
        // within the next period (1.5 cycles):
        //
        //                                      -period/ttl
        //   p(state changes in < period) = 1 - e
        let p_state_change = 1.0 - (-(cycle * 1.5) / self.time_to_leave[state]).exp();

        // p_y_runs_next is the probability that Y runs given that a change
        // occurs, estimated from the transition counts out of this state.
        // The denominator is regularized a bit.
        let p_y_runs_next = f64::from(self.weight[state][ystate] + self.weight[state][3])
            / (f64::from(self.weight[state][state]) + 0.01);

        let p_runs =
            (correlation * p_state_change * p_y_runs_next).clamp(0.0, 1.0 - f64::EPSILON);
        extract_exe!(exe).lnprob += (1.0 - p_runs).ln();
        Ok(())
    }
}

mod macros {
    /// Lock the exe behind an [`ExeForMarkov`] weak handle, erroring out if
    /// the exe has been deallocated.
    #[macro_export]
    macro_rules! extract_exe {
        ($exe:expr) => {{
            $exe.0
                .upgrade()
                .ok_or($crate::Error::ExeMarkovDropped)?
                .lock()
        }};
    }
}
