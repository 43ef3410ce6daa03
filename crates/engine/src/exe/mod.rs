mod inner;

use crate::{Error, ExeMap, Map, Markov, extract_exe};
use inner::ExeInner;
use parking_lot::Mutex;
use std::{
    path::PathBuf,
    sync::{Arc, Weak},
};

/// Handle to a tracked executable.
///
/// Cloning is cheap; all clones refer to the same underlying record. Exes
/// and markov chains reference each other cyclically, so chains hold
/// [`ExeForMarkov`] weak handles instead of `Exe`.
#[derive(Debug, Default, Clone)]
pub struct Exe(pub(crate) Arc<Mutex<ExeInner>>);

/// Weak handle held by markov chains.
#[derive(Debug, Default, Clone)]
pub struct ExeForMarkov(pub(crate) Weak<Mutex<ExeInner>>);

impl Exe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(Arc::new(Mutex::new(ExeInner::new(path))))
    }

    /// Mark the exe as running since `last_running_timestamp`.
    pub fn with_running(self, last_running_timestamp: u64) -> Self {
        self.0.lock().with_running(last_running_timestamp);
        self
    }

    pub fn with_change_timestamp(self, change_timestamp: u64) -> Self {
        self.0.lock().change_timestamp = Some(change_timestamp);
        self
    }

    /// Attach the exemaps of a freshly scanned exe, accumulating its size.
    pub fn with_exemaps(self, exemaps: Vec<ExeMap>) -> Self {
        self.0.lock().with_exemaps(exemaps);
        self
    }

    pub(crate) fn for_markov(&self) -> ExeForMarkov {
        ExeForMarkov(Arc::downgrade(&self.0))
    }

    pub fn path(&self) -> PathBuf {
        self.0.lock().path.clone()
    }

    /// Sequence number assigned at registration time.
    pub fn seq(&self) -> Option<u64> {
        self.0.lock().seq
    }

    pub fn set_seq(&self, seq: u64) {
        self.0.lock().seq.replace(seq);
    }

    /// Sum of the lengths of all attached maps, in bytes.
    pub fn size(&self) -> u64 {
        self.0.lock().size
    }

    /// Cumulative seconds this exe has ever been observed running.
    pub fn time(&self) -> u64 {
        self.0.lock().time
    }

    pub fn set_time(&self, time: u64) {
        self.0.lock().time = time;
    }

    pub fn increase_time(&self, period: u64) {
        self.0.lock().time += period;
    }

    pub fn update_time(&self) -> Option<u64> {
        self.0.lock().update_time
    }

    pub fn set_update_time(&self, update_time: u64) {
        self.0.lock().update_time.replace(update_time);
    }

    pub fn is_running(&self, last_running_timestamp: u64) -> bool {
        self.0.lock().is_running(last_running_timestamp)
    }

    pub fn running_timestamp(&self) -> Option<u64> {
        self.0.lock().running_timestamp
    }

    pub fn update_running_timestamp(&self, running_timestamp: u64) {
        self.0.lock().running_timestamp.replace(running_timestamp);
    }

    pub fn change_timestamp(&self) -> Option<u64> {
        self.0.lock().change_timestamp
    }

    pub fn update_change_timestamp(&self, change_timestamp: u64) {
        self.0.lock().change_timestamp.replace(change_timestamp);
    }

    pub fn lnprob(&self) -> f64 {
        self.0.lock().lnprob
    }

    pub fn zero_lnprob(&self) {
        self.0.lock().lnprob = 0.0;
    }

    pub fn add_lnprob(&self, delta: f64) {
        self.0.lock().lnprob += delta;
    }

    /// Snapshot of the exemap list (handles are shared with the exe).
    pub fn exemaps(&self) -> Vec<ExeMap> {
        self.0.lock().exemaps.clone()
    }

    /// Attach a single exemap, keeping the size sum consistent.
    pub fn add_exemap(&self, exemap: ExeMap) {
        let mut inner = self.0.lock();
        inner.size = inner.size.wrapping_add(exemap.map.length());
        inner.exemaps.push(exemap);
    }

    /// Drop every exemap failing the predicate; returns the maps that lost a
    /// reference so the caller can unref them in the registry.
    pub(crate) fn retain_exemaps(&self, mut keep: impl FnMut(&ExeMap) -> bool) -> Vec<Map> {
        let mut inner = self.0.lock();
        let mut dropped = Vec::new();
        inner.exemaps.retain(|exemap| {
            if keep(exemap) {
                true
            } else {
                dropped.push(exemap.map.clone());
                false
            }
        });
        for map in &dropped {
            inner.size = inner.size.wrapping_sub(map.length());
        }
        dropped
    }

    /// Create and link a markov chain between `self` and `other_exe`.
    ///
    /// Returns `Ok(None)` when both are the same exe.
    pub fn build_markov_chain_with(
        &self,
        other_exe: &Exe,
        state_time: u64,
        last_running_timestamp: u64,
    ) -> Result<Option<Markov>, Error> {
        if self.path() == other_exe.path() {
            return Ok(None);
        }
        let markov = Markov::new(self.for_markov(), other_exe.for_markov())
            .with_initialize(state_time, last_running_timestamp)?;
        Ok(Some(markov))
    }

    pub(crate) fn add_markov(&self, markov: Markov) {
        self.0.lock().markovs.push(markov);
    }

    pub(crate) fn take_markovs(&self) -> Vec<Markov> {
        std::mem::take(&mut self.0.lock().markovs)
    }

    pub(crate) fn remove_markov(&self, markov: &Markov) {
        self.0
            .lock()
            .markovs
            .retain(|m| !Arc::ptr_eq(&m.0, &markov.0));
    }

    /// Notify every chain involving this exe that its running status just
    /// changed.
    pub fn markov_state_changed(
        &self,
        state_time: u64,
        last_running_timestamp: u64,
    ) -> Result<(), Error> {
        // take the chains out because a chain locks the exe back
        let markovs = self.take_markovs();
        let res = markovs
            .iter()
            .try_for_each(|markov| markov.state_changed(state_time, last_running_timestamp));
        self.0.lock().markovs = markovs;
        res
    }

    /// Accrue `period` of simultaneous running time into chains owned by
    /// this exe (each chain is visited through its first participant only).
    pub fn increase_markov_time(&self, period: u64) -> Result<(), Error> {
        let markovs = self.take_markovs();
        let path = self.path();
        let res = markovs.iter().try_for_each(|markov| {
            if extract_exe!(markov.0.lock().exe_a).path == path {
                markov.increase_time(period);
            }
            Ok(())
        });
        self.0.lock().markovs = markovs;
        res
    }

    /// Let every chain owned by this exe place its prediction bids.
    pub fn markov_bid_in_exes(
        &self,
        use_correlation: bool,
        state_time: u64,
        cycle: f64,
    ) -> Result<(), Error> {
        let markovs = self.take_markovs();
        let path = self.path();
        let res = markovs.iter().try_for_each(|markov| {
            if extract_exe!(markov.0.lock().exe_a).path == path {
                markov.bid_in_exes(use_correlation, state_time, cycle)?;
            }
            Ok(())
        });
        self.0.lock().markovs = markovs;
        res
    }

    /// Visit every chain owned by this exe exactly once.
    pub fn foreach_markov<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Markov) -> Result<(), Error>,
    {
        let markovs = self.take_markovs();
        let path = self.path();
        let res = markovs.iter().try_for_each(|markov| {
            if extract_exe!(markov.0.lock().exe_a).path == path {
                f(markov)?;
            }
            Ok(())
        });
        self.0.lock().markovs = markovs;
        res
    }

}

impl ExeForMarkov {
    pub fn path(&self) -> Option<PathBuf> {
        self.0.upgrade().map(|inner| inner.lock().path.clone())
    }
}
