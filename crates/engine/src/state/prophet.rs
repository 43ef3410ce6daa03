//! Prediction: turn the model into a budgeted prefetch plan.

use super::inner::StateInner;
use crate::{Error, Map, utils::kb};
use humansize::{DECIMAL, format_size_i};
use itertools::Itertools;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

impl StateInner {
    /// Accumulate prediction bids and issue the resulting readahead.
    #[tracing::instrument(skip(self))]
    pub(crate) fn prophet_predict(&mut self) -> Result<(), Error> {
        // reset the scratch probabilities we are about to compute
        for exe in self.exes.values() {
            exe.zero_lnprob();
        }
        for map in &self.maps {
            map.zero_lnprob();
        }

        // pairwise chains bid first
        for exe in self.exes.values() {
            exe.markov_bid_in_exes(
                self.config.model.usecorrelation,
                self.time,
                self.config.model.cycle.as_secs_f64(),
            )?;
        }
        trace!("markov chains done bidding");

        // then the sequence model
        self.vomm
            .predict(&self.exes, self.last_running_timestamp);

        if tracing::enabled!(tracing::Level::TRACE) {
            for exe in self.exes.values() {
                trace!(lnprob = exe.lnprob(), path = ?exe.path(), "lnprob of exe");
            }
        }

        self.prophet_readahead()
    }

    /// Convert exe probabilities into a map-level plan bounded by the
    /// memory budget, and hand it to the prefetch controller.
    fn prophet_readahead(&mut self) -> Result<(), Error> {
        let memstat = match self.memory_probe.memstat() {
            Ok(memstat) => memstat,
            Err(err) => {
                warn!(%err, "cannot read memory statistics, skipping prefetch");
                return Ok(());
            }
        };
        self.memstat = memstat;
        self.memstat_timestamp = self.time;

        let budget = self.budget_kb(&memstat);
        let plan = self.assemble_plan(budget);

        if plan.is_empty() {
            debug!("nothing to prefetch");
            return Ok(());
        }

        let mut maps: Vec<Map> = plan.into_iter().map(|(map, _)| map).collect();
        let planned: u64 = maps.iter().map(|map| kb(map.length())).sum();
        trace!(
            "{} available for prefetching, using {} of it",
            format_size_i(budget * 1024, DECIMAL),
            format_size_i(planned as i64 * 1024, DECIMAL),
        );

        let submitted = self
            .controller
            .readahead(&mut maps, self.prefetch_backend.as_ref());
        debug!(
            num_maps = self.maps.len(),
            planned = maps.len(),
            submitted,
            "prefetch pass done"
        );
        Ok(())
    }

    /// Memory we are allowed to fill this cycle, in kilobytes.
    pub(crate) fn budget_kb(&self, memstat: &crate::MemStat) -> i64 {
        let model = &self.config.model;
        let mut avail = i64::from(model.memtotal) * memstat.total as i64 / 100
            + i64::from(model.memfree) * memstat.free as i64 / 100;
        avail = avail.max(0);
        avail += i64::from(model.memcached) * memstat.cached as i64 / 100
            + i64::from(model.membuffers) * memstat.buffers as i64 / 100;
        avail
    }

    /// Walk exes in descending need probability, then their maps in
    /// descending weight, until the budget runs out. Each map appears at
    /// most once, keeping its best bid.
    pub(crate) fn assemble_plan(&self, budget_kb: i64) -> Vec<(Map, f64)> {
        let minprob = self.config.model.minprob;

        let candidates = self
            .exes
            .values()
            .filter(|exe| !exe.is_running(self.last_running_timestamp))
            .map(|exe| (exe.clone(), 1.0 - exe.lnprob().exp()))
            .filter(|(_, priority)| *priority >= minprob)
            .sorted_by(|a, b| b.1.total_cmp(&a.1));

        let mut remaining = budget_kb;
        let mut plan: Vec<(Map, f64)> = Vec::new();
        let mut index: HashMap<Map, usize> = HashMap::new();

        'exes: for (exe, priority) in candidates {
            let exemaps = exe
                .exemaps()
                .into_iter()
                .sorted_by(|a, b| b.prob.total_cmp(&a.prob));

            for exemap in exemaps {
                if remaining <= 0 {
                    break 'exes;
                }
                let bid = priority * exemap.prob;
                if let Some(&slot) = index.get(&exemap.map) {
                    if bid > plan[slot].1 {
                        plan[slot].1 = bid;
                    }
                    continue;
                }
                let map_kb = kb(exemap.map.length()) as i64;
                if map_kb > remaining {
                    continue;
                }
                remaining -= map_kb;
                index.insert(exemap.map.clone(), plan.len());
                plan.push((exemap.map, bid));
            }
        }

        plan
    }
}
