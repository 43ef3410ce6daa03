use crate::{
    Error, Exe, Map, Markov, MemStat, VommTree,
    memstat::MemoryProbe,
    prefetch::{PrefetchBackend, PrefetchController},
    proc::ProcessSource,
    utils::{accept_file, sanitize_file},
};
use config::Config;
use educe::Educe;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::PathBuf,
};
use tracing::{debug, trace};

/// The process-wide model state.
///
/// Mutated only by the scheduler task; the handle in [`super::State`] is the
/// sole way in.
#[derive(Educe)]
#[educe(Debug)]
pub(crate) struct StateInner {
    pub(crate) config: Config,

    /// Where the model is persisted; `None` disables persistence.
    pub(crate) statefile: Option<PathBuf>,

    /// Set when anything changed since the last save.
    pub(crate) dirty: bool,

    /// Set when a scan has run and the model update phase is still due.
    pub(crate) model_dirty: bool,

    /// Virtual seconds since the model was born.
    pub(crate) time: u64,

    pub(crate) last_running_timestamp: u64,

    pub(crate) last_accounting_timestamp: u64,

    pub(crate) map_seq: u64,

    pub(crate) exe_seq: u64,

    /// Registered maps; membership implies `refcount > 0`.
    pub(crate) maps: HashSet<Map>,

    pub(crate) exes: HashMap<PathBuf, Exe>,

    /// Exes too small to be tracked. Value is the observed map size sum.
    pub(crate) bad_exes: HashMap<PathBuf, u64>,

    pub(crate) running_exes: VecDeque<Exe>,

    pub(crate) new_running_exes: VecDeque<Exe>,

    pub(crate) state_changed_exes: VecDeque<Exe>,

    /// Paths seen running that the model does not know yet, keyed by path
    /// with the pid that will be probed for maps.
    pub(crate) new_exes: HashMap<PathBuf, u32>,

    pub(crate) vomm: VommTree,

    pub(crate) memstat: MemStat,

    pub(crate) memstat_timestamp: u64,

    #[educe(Debug(ignore))]
    pub(crate) proc_source: Box<dyn ProcessSource>,

    #[educe(Debug(ignore))]
    pub(crate) memory_probe: Box<dyn MemoryProbe>,

    #[educe(Debug(ignore))]
    pub(crate) prefetch_backend: Box<dyn PrefetchBackend>,

    pub(crate) controller: PrefetchController,
}

impl StateInner {
    pub(crate) fn new(
        config: Config,
        statefile: Option<PathBuf>,
        proc_source: Box<dyn ProcessSource>,
        memory_probe: Box<dyn MemoryProbe>,
        prefetch_backend: Box<dyn PrefetchBackend>,
    ) -> Self {
        let controller = PrefetchController::new(&config);

        Self {
            config,
            statefile,
            dirty: false,
            model_dirty: false,
            time: 0,
            last_running_timestamp: 0,
            last_accounting_timestamp: 0,
            map_seq: 0,
            exe_seq: 0,
            maps: HashSet::new(),
            exes: HashMap::new(),
            bad_exes: HashMap::new(),
            running_exes: VecDeque::new(),
            new_running_exes: VecDeque::new(),
            state_changed_exes: VecDeque::new(),
            new_exes: HashMap::new(),
            vomm: VommTree::new(),
            memstat: MemStat::default(),
            memstat_timestamp: 0,
            proc_source,
            memory_probe,
            prefetch_backend,
            controller,
        }
    }

    /// Throw away everything learned, keeping configuration and
    /// collaborators. Used when the state file turns out to be unusable.
    pub(crate) fn reset_model(&mut self) {
        self.dirty = false;
        self.model_dirty = false;
        self.time = 0;
        self.last_running_timestamp = 0;
        self.last_accounting_timestamp = 0;
        self.map_seq = 0;
        self.exe_seq = 0;
        self.maps.clear();
        self.exes.clear();
        self.bad_exes.clear();
        self.running_exes.clear();
        self.new_running_exes.clear();
        self.state_changed_exes.clear();
        self.new_exes.clear();
        self.vomm = VommTree::new();
    }

    /// Return the registered map equal to the triple, or a fresh unregistered
    /// one with `refcount == 0`.
    pub(crate) fn intern_map(
        &mut self,
        path: impl Into<PathBuf>,
        offset: u64,
        length: u64,
    ) -> Map {
        let map = Map::new(path, offset, length, self.time);
        match self.maps.get(&map) {
            Some(existing) => existing.clone(),
            None => map,
        }
    }

    /// Take a reference on a map. The 0 -> 1 transition registers it and
    /// assigns its sequence number.
    pub(crate) fn map_ref(&mut self, map: &Map) {
        if map.ref_inc() == 1 {
            if map.seq().is_none() {
                map.set_seq(self.map_seq);
                self.map_seq += 1;
            }
            self.maps.insert(map.clone());
        }
    }

    /// Release a reference on a map. The 1 -> 0 transition removes it from
    /// the registry, destroying it once the last handle drops.
    pub(crate) fn map_unref(&mut self, map: &Map) {
        if map.ref_dec() == 0 {
            self.maps.remove(map);
        }
    }

    /// Register a new exe, optionally creating a markov chain against every
    /// exe already known.
    ///
    /// Registering a path twice is a programmer error.
    pub(crate) fn register_exe(&mut self, exe: Exe, create_markovs: bool) -> Result<(), Error> {
        let path = exe.path();
        if self.exes.contains_key(&path) {
            return Err(Error::ExeAlreadyRegistered(path));
        }

        if exe.seq().is_none() {
            exe.set_seq(self.exe_seq);
            self.exe_seq += 1;
        }
        trace!(?exe, "registering exe");

        if create_markovs {
            // the chain is ordered (existing, new) so that initialization
            // can reconstruct the existing exe's earlier transition
            for other_exe in self.exes.values() {
                other_exe.build_markov_chain_with(&exe, self.time, self.last_running_timestamp)?;
            }
        }
        self.exes.insert(path, exe);
        Ok(())
    }

    /// Remove an exe, tearing down its chains and releasing its maps.
    pub(crate) fn unregister_exe(&mut self, exe: &Exe) -> Result<(), Error> {
        let path = exe.path();
        self.exes.remove(&path);

        for markov in exe.take_markovs() {
            let (a, b) = markov.paths()?;
            let other = if a == path { b } else { a };
            if let Some(other_exe) = self.exes.get(&other) {
                other_exe.remove_markov(&markov);
            }
        }

        for exemap in exe.exemaps() {
            self.map_unref(&exemap.map);
        }
        Ok(())
    }

    /// Visit every markov chain exactly once.
    pub(crate) fn markov_foreach<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Markov) -> Result<(), Error>,
    {
        for exe in self.exes.values() {
            exe.foreach_markov(&mut f)?;
        }
        Ok(())
    }

    /// Seed the vomm bigram layer from the pairwise chains so predictions
    /// are useful right after a restart.
    pub(crate) fn hydrate_vomm(&mut self) -> Result<(), Error> {
        let mut seeds = Vec::new();
        self.markov_foreach(|markov| {
            let (a, b) = markov.paths()?;
            let stats = markov.stats();
            seeds.push((a, b, stats.weight[1][3], stats.weight[2][3]));
            Ok(())
        })?;

        for (a, b, a_to_b, b_to_a) in seeds {
            self.vomm.record_bigram(&a, &b, u64::from(a_to_b));
            self.vomm.record_bigram(&b, &a, u64::from(b_to_a));
        }
        Ok(())
    }

    /// Mark the processes alive right now as running, without recording
    /// state transitions. Called once after loading persisted state.
    pub(crate) fn initialize_running(&mut self) -> Result<(), Error> {
        let processes = self.proc_source.running_processes()?;
        let own_pid = std::process::id();

        for (pid, path) in processes {
            if pid == own_pid {
                continue;
            }
            let Some(path) = sanitize_file(&path) else {
                continue;
            };
            if !accept_file(path, &self.config.system.exeprefix) {
                continue;
            }
            if let Some(exe) = self.exes.get(path).cloned() {
                exe.update_running_timestamp(self.time);
                self.running_exes.push_back(exe);
                self.vomm.update(path);
            }
        }
        self.last_running_timestamp = self.time;
        Ok(())
    }

    pub(crate) fn reload_config(&mut self, path: impl AsRef<std::path::Path>) -> Result<(), Error> {
        let config = Config::load(path)?;
        self.controller = PrefetchController::new(&config);
        self.config = config;
        debug!(?self.config, "loaded new config");
        Ok(())
    }

    pub(crate) fn dump_info(&self) {
        tracing::info!(?self.config, "current config");
        tracing::info!(
            time = self.time,
            exe_seq = self.exe_seq,
            map_seq = self.map_seq,
            num_exes = self.exes.len(),
            num_bad_exes = self.bad_exes.len(),
            num_maps = self.maps.len(),
            num_running_exes = self.running_exes.len(),
            vomm_nodes = self.vomm.node_count(),
            "model statistics",
        );
    }

    fn dump_log(&self) {
        debug!(
            time = self.time,
            num_exes = self.exes.len(),
            num_bad_exes = self.bad_exes.len(),
            num_maps = self.maps.len(),
            num_running_exes = self.running_exes.len(),
            "scan summary",
        );
    }

    /// Phase A of the scheduler: scan and predict, then advance half a
    /// cycle.
    #[tracing::instrument(skip(self))]
    pub(crate) fn scan_and_predict(&mut self) -> Result<(), Error> {
        if self.config.system.doscan {
            self.spy_scan()?;
            self.dirty = true;
            self.model_dirty = true;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            self.dump_log();
        }
        if self.config.system.dopredict {
            self.prophet_predict()?;
        }

        self.time += self.config.model.cycle.as_secs() / 2;
        Ok(())
    }

    /// Phase B of the scheduler: fold the scan into the model, then advance
    /// the other half of the cycle.
    #[tracing::instrument(skip(self))]
    pub(crate) fn update(&mut self) -> Result<(), Error> {
        if self.model_dirty {
            self.spy_update_model()?;
            self.model_dirty = false;
        }

        self.time += self.config.model.cycle.as_secs().div_ceil(2);
        Ok(())
    }
}
