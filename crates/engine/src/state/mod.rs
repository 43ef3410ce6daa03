mod cleanup;
mod inner;
mod prophet;
mod spy;

pub(crate) use inner::StateInner;

use crate::{
    Error, MarkovStats,
    memstat::{MemoryProbe, ProcfsMemoryProbe},
    persistence,
    prefetch::{PrefetchBackend, SystemBackend},
    proc::{ProcessSource, ProcfsSource},
};
use config::Config;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::RwLock, time};
use tracing::warn;

/// Counters reported by the dump-log signal and the tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStats {
    pub time: u64,
    pub num_exes: usize,
    pub num_bad_exes: usize,
    pub num_maps: usize,
    pub num_running_exes: usize,
}

/// Snapshot of one exe for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExeSnapshot {
    pub seq: Option<u64>,
    pub size: u64,
    pub time: u64,
    pub running: bool,
}

/// Handle to the model state.
///
/// All mutation happens on the single scheduler task; the handle merely
/// serializes access for signals, the autosaver, and tests.
#[derive(Debug, Clone)]
pub struct State {
    inner: Arc<RwLock<StateInner>>,
}

impl State {
    /// Build a state wired to the live system: procfs process and memory
    /// sources and the kernel prefetch backend.
    pub fn try_new(config: Config, statefile: Option<PathBuf>) -> Result<Self, Error> {
        Self::with_sources(
            config,
            statefile,
            Box::new(ProcfsSource),
            Box::new(ProcfsMemoryProbe),
            Box::new(SystemBackend),
        )
    }

    /// Build a state with explicit collaborators. Loads the statefile when
    /// one is given; an unusable file is logged and replaced by an empty
    /// model.
    pub fn with_sources(
        config: Config,
        statefile: Option<PathBuf>,
        proc_source: Box<dyn ProcessSource>,
        memory_probe: Box<dyn MemoryProbe>,
        prefetch_backend: Box<dyn PrefetchBackend>,
    ) -> Result<Self, Error> {
        let mut inner = StateInner::new(
            config,
            statefile.clone(),
            proc_source,
            memory_probe,
            prefetch_backend,
        );

        if let Some(statefile) = &statefile {
            if let Err(err) = persistence::load_state(&mut inner, statefile) {
                warn!(%err, path = ?statefile, "state file is unusable, starting with an empty model");
                inner.reset_model();
            }
        }

        inner.hydrate_vomm()?;
        inner.initialize_running()?;

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Run scan/update phases forever, half a cycle apart.
    #[tracing::instrument(skip_all)]
    pub async fn start(self) -> Result<(), Error> {
        let state = self.inner;
        loop {
            let cycle = {
                let mut inner = state.write().await;
                inner.scan_and_predict()?;
                inner.config.model.cycle
            };
            time::sleep(cycle / 2).await;

            let cycle = {
                let mut inner = state.write().await;
                inner.update()?;
                inner.config.model.cycle
            };
            time::sleep((cycle + Duration::from_secs(1)) / 2).await;
        }
    }

    /// Execute the scan phase once (scan, predict, advance τ/2).
    pub async fn scan_and_predict(&self) -> Result<(), Error> {
        self.inner.write().await.scan_and_predict()
    }

    /// Execute the update phase once (fold model, advance (τ+1)/2).
    pub async fn update(&self) -> Result<(), Error> {
        self.inner.write().await.update()
    }

    /// Save the state if dirty, then clean up stale entries and give bad
    /// exes another chance.
    ///
    /// A failed write leaves the model dirty so the next autosave retries.
    #[tracing::instrument(skip_all)]
    pub async fn write(&self) -> Result<(), Error> {
        let mut inner = self.inner.write().await;

        if inner.dirty {
            if let Some(statefile) = inner.statefile.clone() {
                match persistence::save_state(&inner, &statefile) {
                    Ok(()) => inner.dirty = false,
                    Err(err) => warn!(%err, "failed saving state"),
                }
            } else {
                inner.dirty = false;
            }
        }

        inner.cleanup_stale();
        // give the small ones another chance
        inner.bad_exes.clear();
        Ok(())
    }

    pub async fn dump_info(&self) {
        self.inner.read().await.dump_info();
    }

    pub async fn reload_config(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.inner.write().await.reload_config(path)
    }

    pub async fn stats(&self) -> ModelStats {
        let inner = self.inner.read().await;
        ModelStats {
            time: inner.time,
            num_exes: inner.exes.len(),
            num_bad_exes: inner.bad_exes.len(),
            num_maps: inner.maps.len(),
            num_running_exes: inner.running_exes.len(),
        }
    }

    /// Introspect one exe by path.
    pub async fn exe_snapshot(&self, path: &Path) -> Option<ExeSnapshot> {
        let inner = self.inner.read().await;
        let exe = inner.exes.get(path)?;
        Some(ExeSnapshot {
            seq: exe.seq(),
            size: exe.size(),
            time: exe.time(),
            running: exe.is_running(inner.last_running_timestamp),
        })
    }

    /// Introspect the chain between two exes, if one exists.
    pub async fn markov_between(&self, a: &Path, b: &Path) -> Option<MarkovStats> {
        let inner = self.inner.read().await;
        let exe = inner.exes.get(a)?;
        let mut found = None;
        {
            let mut matcher = |markov: &crate::Markov| -> Result<(), Error> {
                let (chain_a, chain_b) = markov.paths()?;
                if (chain_a.as_path() == a && chain_b.as_path() == b)
                    || (chain_a.as_path() == b && chain_b.as_path() == a)
                {
                    found = Some(markov.stats());
                }
                Ok(())
            };
            exe.foreach_markov(&mut matcher).ok()?;
        }
        if found.is_none() {
            // the chain may be owned by the other side
            let other = inner.exes.get(b)?;
            let mut matcher = |markov: &crate::Markov| -> Result<(), Error> {
                let (chain_a, chain_b) = markov.paths()?;
                if (chain_a.as_path() == a && chain_b.as_path() == b)
                    || (chain_a.as_path() == b && chain_b.as_path() == a)
                {
                    found = Some(markov.stats());
                }
                Ok(())
            };
            other.foreach_markov(&mut matcher).ok()?;
        }
        found
    }

    /// Observed count for the `prev -> next` launch sequence.
    pub async fn bigram_count(&self, prev: &Path, next: &Path) -> u64 {
        self.inner.read().await.vomm.bigram_count(prev, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::RawMap;
    use crate::test_support::{empty_inner, shared_inner};
    use crate::{Exe, ExeMap};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    fn lib_maps(tag: &str, length: u64) -> Vec<RawMap> {
        vec![RawMap {
            path: p(&format!("/usr/lib/lib{tag}.so")),
            offset: 0,
            length,
        }]
    }

    // First observation of two exes and a simple sequence: A alone, then A
    // and B, then B alone.
    #[test]
    fn two_exes_and_a_simple_sequence() {
        let (mut inner, source) = shared_inner();

        // t=0: only A
        source.set_processes(vec![(42, p("/usr/bin/A"))]);
        source.set_maps(42, lib_maps("A", 5_000_000));
        inner.time = 0;
        inner.spy_scan().unwrap();
        inner.time = 5;
        inner.spy_update_model().unwrap();

        assert!(inner.exes.contains_key(&p("/usr/bin/A")));

        // t=10: A and B
        source.set_processes(vec![(42, p("/usr/bin/A")), (43, p("/usr/bin/B"))]);
        source.set_maps(43, lib_maps("B", 6_000_000));
        inner.time = 10;
        inner.spy_scan().unwrap();
        inner.time = 15;
        inner.spy_update_model().unwrap();

        assert!(inner.exes.contains_key(&p("/usr/bin/B")));

        // t=20: only B
        source.set_processes(vec![(43, p("/usr/bin/B"))]);
        inner.time = 20;
        inner.spy_scan().unwrap();
        inner.time = 25;
        inner.spy_update_model().unwrap();

        let mut stats = None;
        inner
            .markov_foreach(|markov| {
                stats = Some((markov.paths()?, markov.stats()));
                Ok(())
            })
            .unwrap();
        let ((chain_a, chain_b), stats) = stats.expect("no markov chain created");

        // orient the weight matrix so index 1 is "A only"
        let (a_to_both, a_stops) = if chain_a == p("/usr/bin/A") {
            (stats.weight[1][3], stats.weight[3][2])
        } else {
            (stats.weight[2][3], stats.weight[3][1])
        };
        assert!(chain_a == p("/usr/bin/A") || chain_b == p("/usr/bin/A"));
        assert!(a_to_both >= 1, "weights: {:?}", stats.weight);
        assert!(a_stops >= 1, "weights: {:?}", stats.weight);

        // the launch sequence reached the vomm bigram layer
        assert!(inner.vomm.bigram_count(&p("/usr/bin/A"), &p("/usr/bin/B")) >= 1);
    }

    #[test]
    fn small_exes_are_blacklisted_until_amnesty() {
        let (mut inner, source) = shared_inner();
        inner.config.model.minsize = 1_000_000;

        source.set_processes(vec![(10, p("/usr/bin/tiny"))]);
        source.set_maps(10, lib_maps("tiny", 50_000));
        inner.time = 0;
        inner.spy_scan().unwrap();
        inner.spy_update_model().unwrap();

        assert!(!inner.exes.contains_key(&p("/usr/bin/tiny")));
        assert_eq!(inner.bad_exes.get(&p("/usr/bin/tiny")), Some(&50_000));

        // a later scan must not even queue it again
        inner.time = 10;
        inner.spy_scan().unwrap();
        assert!(inner.new_exes.is_empty());
    }

    #[test]
    fn vanished_pid_is_skipped_silently() {
        let (mut inner, source) = shared_inner();

        // enumerated but no maps available: the pid died in between
        source.set_processes(vec![(99, p("/usr/bin/ghost"))]);
        inner.time = 0;
        inner.spy_scan().unwrap();
        inner.spy_update_model().unwrap();

        assert!(inner.exes.is_empty());
        assert!(inner.bad_exes.is_empty());
    }

    // Reference discipline: every registered map's refcount equals the
    // number of exemaps pointing at it, and the 1 -> 0 transition removes
    // the map.
    #[test]
    fn map_refcounts_follow_exemap_ownership() {
        let (mut inner, source) = shared_inner();

        let shared = RawMap {
            path: p("/usr/lib/libshared.so"),
            offset: 0,
            length: 3_000_000,
        };
        source.set_processes(vec![(1, p("/usr/bin/A")), (2, p("/usr/bin/B"))]);
        source.set_maps(1, vec![shared.clone()]);
        source.set_maps(2, vec![shared]);

        inner.time = 0;
        inner.spy_scan().unwrap();
        inner.spy_update_model().unwrap();

        assert_eq!(inner.maps.len(), 1);
        let map = inner.maps.iter().next().unwrap().clone();
        assert_eq!(map.refcount(), 2);

        let exe_a = inner.exes.get(&p("/usr/bin/A")).unwrap().clone();
        inner.unregister_exe(&exe_a).unwrap();
        assert_eq!(map.refcount(), 1);
        assert_eq!(inner.maps.len(), 1);

        let exe_b = inner.exes.get(&p("/usr/bin/B")).unwrap().clone();
        inner.unregister_exe(&exe_b).unwrap();
        assert_eq!(map.refcount(), 0);
        assert!(inner.maps.is_empty());
    }

    #[test]
    fn unregister_tears_down_chains_on_both_sides() {
        let (mut inner, source) = shared_inner();

        source.set_processes(vec![(1, p("/usr/bin/A")), (2, p("/usr/bin/B"))]);
        source.set_maps(1, lib_maps("A", 2_000_000));
        source.set_maps(2, lib_maps("B", 2_000_000));
        inner.time = 0;
        inner.spy_scan().unwrap();
        inner.spy_update_model().unwrap();

        let mut chains = 0;
        inner
            .markov_foreach(|_| {
                chains += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(chains, 1);

        let exe_a = inner.exes.get(&p("/usr/bin/A")).unwrap().clone();
        inner.unregister_exe(&exe_a).unwrap();

        let mut chains = 0;
        inner
            .markov_foreach(|_| {
                chains += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(chains, 0);
    }

    // Budget obeyed: 10 MB, 5 MB, and 2 MB exes against a 6 MB budget.
    #[test]
    fn plan_respects_memory_budget() {
        let mut inner = empty_inner();
        inner.last_running_timestamp = 100;

        let sizes = [
            ("/usr/bin/big", 10 * 1024, -0.1f64),
            ("/usr/bin/mid", 5 * 1024, -0.2),
            ("/usr/bin/small", 2 * 1024, -3.0),
        ];
        for (path, kb_size, lnprob) in sizes {
            let map = inner.intern_map(format!("{path}.map"), 0, kb_size * 1024);
            inner.map_ref(&map);
            let exe = Exe::new(path).with_exemaps(vec![ExeMap::new(map)]);
            exe.add_lnprob(lnprob);
            inner.register_exe(exe, false).unwrap();
        }

        let budget_kb = 6 * 1024;
        let plan = inner.assemble_plan(budget_kb);

        let total_kb: u64 = plan
            .iter()
            .map(|(map, _)| crate::utils::kb(map.length()))
            .sum();
        assert!(total_kb <= budget_kb as u64);

        // the most likely exe comes first and the small exe must fit
        assert_eq!(plan[0].0.path(), std::path::Path::new("/usr/bin/small.map"));
        assert!(
            plan.iter()
                .any(|(map, _)| map.path() == std::path::Path::new("/usr/bin/small.map"))
        );
    }

    #[test]
    fn running_exes_are_not_planned() {
        let mut inner = empty_inner();
        inner.time = 50;
        inner.last_running_timestamp = 50;

        let map = inner.intern_map("/usr/lib/libx.so", 0, 1024 * 1024);
        inner.map_ref(&map);
        let exe = Exe::new("/usr/bin/x")
            .with_running(50)
            .with_exemaps(vec![ExeMap::new(map)]);
        exe.add_lnprob(-5.0);
        inner.register_exe(exe, false).unwrap();

        assert!(inner.assemble_plan(1 << 20).is_empty());
    }

    proptest! {
        // Invariant: the plan never exceeds the budget, whatever the mix of
        // exes, maps, and probabilities.
        #[test]
        fn plan_total_never_exceeds_budget(
            exes in prop::collection::vec(
                (1u64..20_000, -4.0f64..0.0),
                0..12,
            ),
            budget in 0i64..30_000,
        ) {
            let mut inner = empty_inner();
            inner.last_running_timestamp = 10;

            for (i, (kb_size, lnprob)) in exes.into_iter().enumerate() {
                let map = inner.intern_map(format!("/map/{i}"), 0, kb_size * 1024);
                inner.map_ref(&map);
                let exe = Exe::new(format!("/exe/{i}")).with_exemaps(vec![ExeMap::new(map)]);
                exe.add_lnprob(lnprob);
                inner.register_exe(exe, false).unwrap();
            }

            let plan = inner.assemble_plan(budget);
            let total: u64 = plan
                .iter()
                .map(|(map, _)| crate::utils::kb(map.length()))
                .sum();
            prop_assert!((total as i64) <= budget.max(0));

            // each map appears at most once
            let unique: std::collections::HashSet<_> =
                plan.iter().map(|(map, _)| map.clone()).collect();
            prop_assert_eq!(unique.len(), plan.len());
        }
    }

    #[test]
    fn budget_formula_combines_factors() {
        let mut inner = empty_inner();
        inner.config.model.memtotal = -10;
        inner.config.model.memfree = 50;
        inner.config.model.memcached = 0;
        inner.config.model.membuffers = 50;

        let memstat = crate::MemStat {
            total: 1000,
            free: 600,
            buffers: 200,
            cached: 400,
            available: 800,
        };
        // max(0, -100 + 300) + 0 + 100
        assert_eq!(inner.budget_kb(&memstat), 300);

        inner.config.model.memtotal = -100;
        inner.config.model.memfree = 0;
        // max(0, -1000) + 100
        assert_eq!(inner.budget_kb(&memstat), 100);
    }

    #[test]
    fn reset_model_clears_everything() {
        let mut inner = crate::test_support::inner_with_two_exes();
        inner.dirty = true;
        inner.reset_model();
        assert!(inner.exes.is_empty());
        assert!(inner.maps.is_empty());
        assert_eq!(inner.time, 0);
        assert_eq!(inner.exe_seq, 0);
    }
}
