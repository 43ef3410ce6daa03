mod inner;
mod markov_state;

use crate::{Error, exe::ExeForMarkov, extract_exe};
use inner::MarkovInner;
pub use markov_state::MarkovState;
use parking_lot::Mutex;
use std::{path::PathBuf, sync::Arc};

/// Snapshot of a chain's persistent statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkovStats {
    pub time: u64,
    pub time_to_leave: [f64; 4],
    pub weight: [[u32; 4]; 4],
    pub state: MarkovState,
    pub change_timestamp: u64,
}

/// A continuous-time 4-state markov chain over the joint running status of
/// two exes.
///
/// A chain is jointly owned by its two participants: each exe's markov list
/// holds a clone of this handle, and the chain itself holds weak handles
/// back. Tearing down either exe drops the chain from both lists.
#[derive(Debug, Clone)]
pub struct Markov(pub(crate) Arc<Mutex<MarkovInner>>);

impl Markov {
    pub fn new(exe_a: ExeForMarkov, exe_b: ExeForMarkov) -> Self {
        Self(Arc::new(Mutex::new(MarkovInner::new(exe_a, exe_b))))
    }

    /// Initialize state and statistics for a chain created mid-run, then
    /// link it into both participants.
    pub fn with_initialize(
        self,
        state_time: u64,
        last_running_timestamp: u64,
    ) -> Result<Markov, Error> {
        {
            let lock = &mut self.0.lock();
            lock.initialize(state_time, last_running_timestamp)?;
            extract_exe!(lock.exe_a).markovs.push(self.clone());
            extract_exe!(lock.exe_b).markovs.push(self.clone());
        }
        Ok(self)
    }

    /// Link into both participants without touching the statistics. Used
    /// when restoring chains from the state file.
    pub fn linked(self) -> Result<Markov, Error> {
        {
            let lock = &mut self.0.lock();
            extract_exe!(lock.exe_a).markovs.push(self.clone());
            extract_exe!(lock.exe_b).markovs.push(self.clone());
        }
        Ok(self)
    }

    pub fn state_changed(&self, state_time: u64, last_running_timestamp: u64) -> Result<(), Error> {
        self.0
            .lock()
            .state_changed(state_time, last_running_timestamp)
    }

    /// Recompute the state from the exes' running flags.
    pub fn set_state(&self, last_running_timestamp: u64) -> Result<(), Error> {
        self.0.lock().set_state(last_running_timestamp)
    }

    /// Accrue simultaneous running time while in state 3.
    pub fn increase_time(&self, period: u64) {
        let mut markov = self.0.lock();
        if markov.state == MarkovState::BothRunning {
            markov.time += period;
        }
    }

    pub fn correlation(&self, state_time: u64) -> Result<f64, Error> {
        self.0.lock().correlation(state_time)
    }

    pub fn bid_in_exes(
        &self,
        use_correlation: bool,
        state_time: u64,
        cycle: f64,
    ) -> Result<(), Error> {
        self.0
            .lock()
            .bid_in_exes(use_correlation, state_time, cycle)
    }

    /// Paths of the two participants, in order.
    pub fn paths(&self) -> Result<(PathBuf, PathBuf), Error> {
        let lock = self.0.lock();
        let a = extract_exe!(lock.exe_a).path.clone();
        let b = extract_exe!(lock.exe_b).path.clone();
        Ok((a, b))
    }

    /// Sequence numbers of the two participants, in order.
    pub fn seqs(&self) -> Result<(Option<u64>, Option<u64>), Error> {
        let lock = self.0.lock();
        let a = extract_exe!(lock.exe_a).seq;
        let b = extract_exe!(lock.exe_b).seq;
        Ok((a, b))
    }

    pub fn stats(&self) -> MarkovStats {
        let lock = self.0.lock();
        MarkovStats {
            time: lock.time,
            time_to_leave: lock.time_to_leave,
            weight: lock.weight,
            state: lock.state,
            change_timestamp: lock.change_timestamp,
        }
    }

    /// Overwrite the persistent statistics (state-file restore).
    pub fn set_stats(&self, time: u64, time_to_leave: [f64; 4], weight: [[u32; 4]; 4]) {
        let mut lock = self.0.lock();
        lock.time = time;
        lock.time_to_leave = time_to_leave;
        lock.weight = weight;
    }
}
