#![forbid(unsafe_code)]

use crate::sort_strategy::SortStrategy;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct System {
    /// Whether the model should be updated from running processes.
    pub doscan: bool,

    /// Whether prediction and prefetching should run.
    pub dopredict: bool,

    /// Autosave interval for state persistence.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub autosave: Duration,

    /// Map path prefixes ("!" means deny; the longest matching prefix
    /// decides; no match accepts).
    pub mapprefix: Vec<String>,

    /// Exe path prefixes (same semantics as `mapprefix`).
    pub exeprefix: Vec<String>,

    /// Max number of concurrent prefetch workers. 0 runs requests inline on
    /// the scheduler.
    pub processes: usize,

    /// Prefetch I/O sort strategy.
    pub sortstrategy: SortStrategy,
}

impl Default for System {
    fn default() -> Self {
        Self {
            doscan: true,
            dopredict: true,
            autosave: Duration::from_secs(3600),
            mapprefix: vec![
                "/usr/".into(),
                "/lib".into(),
                "/var/cache/".into(),
                "!/".into(),
            ],
            exeprefix: vec![
                "!/usr/sbin/".into(),
                "!/usr/local/sbin/".into(),
                "/usr/".into(),
                "!/".into(),
            ],
            processes: 30,
            sortstrategy: SortStrategy::Block,
        }
    }
}
