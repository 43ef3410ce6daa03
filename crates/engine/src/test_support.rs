//! Shared fixtures for the crate's unit tests.

use crate::memstat::{FixedMemoryProbe, MemoryProbe};
use crate::prefetch::PrefetchBackend;
use crate::proc::{ProcessSource, RawMap};
use crate::state::StateInner;
use crate::{Error, Exe, ExeMap, MemStat};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A process source fed from a fixed table.
#[derive(Debug, Default)]
pub(crate) struct StaticSource {
    pub processes: Vec<(u32, PathBuf)>,
    pub maps: HashMap<u32, Vec<RawMap>>,
}

impl ProcessSource for StaticSource {
    fn running_processes(&mut self) -> Result<Vec<(u32, PathBuf)>, Error> {
        Ok(self.processes.clone())
    }

    fn process_maps(&mut self, pid: u32) -> Result<Vec<RawMap>, Error> {
        self.maps.get(&pid).cloned().ok_or_else(|| {
            Error::FileIOFailed(std::io::Error::from(std::io::ErrorKind::NotFound))
        })
    }
}

/// A backend that accepts everything without side effects.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NoopBackend;

impl PrefetchBackend for NoopBackend {
    fn readahead(&self, _path: &Path, _offset: u64, _length: u64) -> std::io::Result<()> {
        Ok(())
    }

    fn map_and_advise(&self, _path: &Path, _offset: u64, _length: u64) -> std::io::Result<()> {
        Ok(())
    }
}

/// A process source whose table can be swapped from outside while the state
/// owns it.
#[derive(Debug, Default, Clone)]
pub(crate) struct SharedSource(pub std::sync::Arc<parking_lot::Mutex<StaticSource>>);

impl SharedSource {
    pub fn set_processes(&self, processes: Vec<(u32, PathBuf)>) {
        self.0.lock().processes = processes;
    }

    pub fn set_maps(&self, pid: u32, maps: Vec<RawMap>) {
        self.0.lock().maps.insert(pid, maps);
    }
}

impl ProcessSource for SharedSource {
    fn running_processes(&mut self) -> Result<Vec<(u32, PathBuf)>, Error> {
        self.0.lock().running_processes()
    }

    fn process_maps(&mut self, pid: u32) -> Result<Vec<RawMap>, Error> {
        self.0.lock().process_maps(pid)
    }
}

pub(crate) fn probe(memstat: MemStat) -> Box<dyn MemoryProbe> {
    Box::new(FixedMemoryProbe(memstat))
}

pub(crate) fn empty_inner() -> StateInner {
    inner_with_source(StaticSource::default())
}

pub(crate) fn shared_inner() -> (StateInner, SharedSource) {
    let source = SharedSource::default();
    let inner = inner_with_boxed_source(Box::new(source.clone()));
    (inner, source)
}

pub(crate) fn inner_with_source(source: StaticSource) -> StateInner {
    inner_with_boxed_source(Box::new(source))
}

fn inner_with_boxed_source(source: Box<dyn ProcessSource>) -> StateInner {
    let mut config = config::Config::default();
    config.model.minsize = 1000;
    config.system.exeprefix = vec![];
    config.system.mapprefix = vec![];
    config.system.processes = 0;
    config.system.sortstrategy = config::SortStrategy::None;

    StateInner::new(
        config,
        None,
        source,
        probe(MemStat {
            total: 1024 * 1024,
            free: 512 * 1024,
            buffers: 64 * 1024,
            cached: 128 * 1024,
            available: 600 * 1024,
        }),
        Box::new(NoopBackend),
    )
}

/// Two exes with maps and one markov chain carrying a distinctive
/// `weight[1][3]` count.
pub(crate) fn inner_with_two_exes() -> StateInner {
    let mut inner = empty_inner();
    inner.time = 1000;
    inner.last_accounting_timestamp = 1000;

    let libgtk = inner.intern_map("/usr/lib/libgtk.so", 0, 300_000);
    let libxul = inner.intern_map("/usr/lib/libxul.so", 4096, 9_000_000);
    let libvim = inner.intern_map("/usr/lib/vim/libvim.so", 0, 2_500_000);

    let firefox = Exe::new("/usr/bin/firefox");
    firefox.set_time(200);
    firefox.set_update_time(900);
    for map in [&libgtk, &libxul] {
        inner.map_ref(map);
        firefox.add_exemap(ExeMap::new(map.clone()));
    }
    inner.register_exe(firefox.clone(), false).unwrap();

    let vim = Exe::new("/usr/bin/vim");
    vim.set_time(150);
    vim.set_update_time(950);
    for map in [&libgtk, &libvim] {
        inner.map_ref(map);
        vim.add_exemap(ExeMap::new(map.clone()));
    }
    inner.register_exe(vim.clone(), false).unwrap();

    let markov = firefox
        .build_markov_chain_with(&vim, inner.time, inner.last_running_timestamp)
        .unwrap()
        .unwrap();
    let mut weight = [[0u32; 4]; 4];
    weight[1][1] = 9;
    weight[1][3] = 7;
    weight[1][0] = 2;
    weight[3][3] = 4;
    weight[3][2] = 4;
    markov.set_stats(120, [30.0, 12.5, 8.0, 60.0], weight);

    inner
}
