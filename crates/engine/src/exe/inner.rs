use crate::{ExeMap, Markov};
use educe::Educe;
use std::path::PathBuf;

#[derive(Default, Clone, Educe)]
#[educe(Debug)]
pub(crate) struct ExeInner {
    pub(crate) path: PathBuf,

    #[educe(Debug(ignore))]
    pub(crate) exemaps: Vec<ExeMap>,

    /// Sum of lengths of all attached maps, in bytes.
    pub(crate) size: u64,

    /// Sequence number, assigned at registration.
    pub(crate) seq: Option<u64>,

    /// Cumulative seconds this exe has ever been running.
    pub(crate) time: u64,

    pub(crate) update_time: Option<u64>,

    pub(crate) running_timestamp: Option<u64>,

    /// Time of the last running-status flip. `None` for exes restored from
    /// the state file that have not been seen since.
    pub(crate) change_timestamp: Option<u64>,

    /// Log-probability of NOT being needed in the next period. Scratch,
    /// rewritten by every prediction pass.
    pub(crate) lnprob: f64,

    #[educe(Debug(ignore))]
    pub(crate) markovs: Vec<Markov>,
}

impl ExeInner {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub(crate) fn with_running(&mut self, last_running_timestamp: u64) -> &mut Self {
        self.update_time.replace(last_running_timestamp);
        self.running_timestamp.replace(last_running_timestamp);
        self
    }

    pub(crate) fn with_exemaps(&mut self, exemaps: Vec<ExeMap>) -> &mut Self {
        let size = exemaps
            .iter()
            .map(|exemap| exemap.map.length())
            .fold(0u64, |acc, x| acc.wrapping_add(x));
        self.size = self.size.wrapping_add(size);
        self.exemaps = exemaps;
        self
    }

    pub(crate) fn is_running(&self, last_running_timestamp: u64) -> bool {
        self.running_timestamp
            .is_some_and(|running| running >= last_running_timestamp)
    }
}
