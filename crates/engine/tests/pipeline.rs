//! End-to-end checks through the public engine API: a scripted process
//! table drives scan/update cycles, and the learned model is inspected,
//! persisted, and restored.

use engine::memstat::{MemStat, MemoryProbe};
use engine::prefetch::PrefetchBackend;
use engine::proc::{ProcessSource, RawMap};
use engine::{Error, State};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ProcessTable {
    processes: Vec<(u32, PathBuf)>,
    maps: HashMap<u32, Vec<RawMap>>,
}

#[derive(Debug, Default, Clone)]
struct SharedTable(Arc<Mutex<ProcessTable>>);

impl SharedTable {
    fn set_processes(&self, processes: &[(u32, &str)]) {
        self.0.lock().processes = processes
            .iter()
            .map(|(pid, path)| (*pid, PathBuf::from(path)))
            .collect();
    }

    fn set_maps(&self, pid: u32, path: &str, length: u64) {
        self.0.lock().maps.insert(
            pid,
            vec![RawMap {
                path: PathBuf::from(path),
                offset: 0,
                length,
            }],
        );
    }
}

impl ProcessSource for SharedTable {
    fn running_processes(&mut self) -> Result<Vec<(u32, PathBuf)>, Error> {
        Ok(self.0.lock().processes.clone())
    }

    fn process_maps(&mut self, pid: u32) -> Result<Vec<RawMap>, Error> {
        self.0.lock().maps.get(&pid).cloned().ok_or_else(|| {
            Error::FileIOFailed(std::io::Error::from(std::io::ErrorKind::NotFound))
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct FixedProbe(MemStat);

impl MemoryProbe for FixedProbe {
    fn memstat(&mut self) -> Result<MemStat, Error> {
        Ok(self.0)
    }
}

#[derive(Debug, Default)]
struct RecordingBackend {
    readaheads: Mutex<Vec<PathBuf>>,
}

#[derive(Debug, Default, Clone)]
struct SharedBackend(Arc<RecordingBackend>);

impl PrefetchBackend for SharedBackend {
    fn readahead(&self, path: &Path, _offset: u64, _length: u64) -> std::io::Result<()> {
        self.0.readaheads.lock().push(path.to_path_buf());
        Ok(())
    }

    fn map_and_advise(&self, path: &Path, _offset: u64, _length: u64) -> std::io::Result<()> {
        self.0.readaheads.lock().push(path.to_path_buf());
        Ok(())
    }
}

fn test_config() -> config::Config {
    let mut config = config::Config::default();
    config.model.minsize = 1_000_000;
    config.model.usecorrelation = false;
    config.system.processes = 0;
    config.system.sortstrategy = config::SortStrategy::None;
    config
}

fn big_memory() -> MemStat {
    MemStat {
        total: 1_000_000,
        free: 1_000_000,
        buffers: 0,
        cached: 0,
        available: 1_000_000,
    }
}

fn build_state(
    table: &SharedTable,
    backend: &SharedBackend,
    statefile: Option<PathBuf>,
) -> State {
    State::with_sources(
        test_config(),
        statefile,
        Box::new(table.clone()),
        Box::new(FixedProbe(big_memory())),
        Box::new(backend.clone()),
    )
    .unwrap()
}

async fn run_cycle(state: &State) {
    state.scan_and_predict().await.unwrap();
    state.update().await.unwrap();
}

#[tokio::test]
async fn sequence_learns_chain_and_drives_prefetch() {
    let table = SharedTable::default();
    let backend = SharedBackend::default();
    table.set_maps(42, "/usr/lib/libA.so", 5_000_000);
    table.set_maps(43, "/usr/lib/libB.so", 6_000_000);

    let state = build_state(&table, &backend, None);

    // A runs alone, then A and B together, then B alone
    table.set_processes(&[(42, "/usr/bin/A")]);
    run_cycle(&state).await;

    table.set_processes(&[(42, "/usr/bin/A"), (43, "/usr/bin/B")]);
    run_cycle(&state).await;

    table.set_processes(&[(43, "/usr/bin/B")]);
    run_cycle(&state).await;

    let stats = state.stats().await;
    assert_eq!(stats.num_exes, 2);
    assert_eq!(stats.num_maps, 2);

    let chain = state
        .markov_between(Path::new("/usr/bin/A"), Path::new("/usr/bin/B"))
        .await
        .expect("no chain between A and B");
    assert!(chain.weight[1][3] >= 1, "weights: {:?}", chain.weight);
    assert!(chain.weight[3][2] >= 1, "weights: {:?}", chain.weight);

    assert!(
        state
            .bigram_count(Path::new("/usr/bin/A"), Path::new("/usr/bin/B"))
            .await
            >= 1
    );

    // two more cycles with only A running: the chain sits in "A only" and
    // the prophet should ask for B's map
    table.set_processes(&[(42, "/usr/bin/A")]);
    run_cycle(&state).await;
    backend.0.readaheads.lock().clear();
    run_cycle(&state).await;

    let readaheads = backend.0.readaheads.lock();
    assert!(
        readaheads.contains(&PathBuf::from("/usr/lib/libB.so")),
        "prefetched: {readaheads:?}"
    );
    assert!(!readaheads.contains(&PathBuf::from("/usr/lib/libA.so")));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let statefile = dir.path().join("presage.state");

    let table = SharedTable::default();
    let backend = SharedBackend::default();
    table.set_maps(42, "/usr/lib/libA.so", 5_000_000);
    table.set_maps(43, "/usr/lib/libB.so", 6_000_000);

    let state = build_state(&table, &backend, Some(statefile.clone()));

    table.set_processes(&[(42, "/usr/bin/A")]);
    run_cycle(&state).await;
    table.set_processes(&[(42, "/usr/bin/A"), (43, "/usr/bin/B")]);
    run_cycle(&state).await;
    table.set_processes(&[(43, "/usr/bin/B")]);
    run_cycle(&state).await;

    let chain_before = state
        .markov_between(Path::new("/usr/bin/A"), Path::new("/usr/bin/B"))
        .await
        .unwrap();
    let exe_before = state.exe_snapshot(Path::new("/usr/bin/A")).await.unwrap();

    state.write().await.unwrap();
    let header = std::fs::read_to_string(&statefile).unwrap();
    assert!(header.starts_with("PRELOAD\t"));

    let restored = build_state(&table, &backend, Some(statefile));
    let stats = restored.stats().await;
    assert_eq!(stats.num_exes, 2);

    let exe_after = restored.exe_snapshot(Path::new("/usr/bin/A")).await.unwrap();
    assert_eq!(exe_after.time, exe_before.time);
    assert_eq!(exe_after.seq, exe_before.seq);

    let chain_after = restored
        .markov_between(Path::new("/usr/bin/A"), Path::new("/usr/bin/B"))
        .await
        .unwrap();
    assert_eq!(chain_after.weight, chain_before.weight);
    assert_eq!(chain_after.time, chain_before.time);
    assert_eq!(chain_after.time_to_leave, chain_before.time_to_leave);

    // the bigram layer was rehydrated from the chains
    assert!(
        restored
            .bigram_count(Path::new("/usr/bin/A"), Path::new("/usr/bin/B"))
            .await
            >= 1
    );
}

#[tokio::test]
async fn stale_exes_are_dropped_after_save() {
    let dir = tempfile::tempdir().unwrap();
    let exe_path = dir.path().join("transient-binary");
    std::fs::write(&exe_path, b"#!/bin/sh\n").unwrap();
    let exe_str = exe_path.to_str().unwrap().to_string();

    let table = SharedTable::default();
    let backend = SharedBackend::default();
    table.set_maps(7, "/usr/lib/libT.so", 4_000_000);
    table.set_processes(&[(7, &exe_str)]);

    let mut config = test_config();
    config.system.exeprefix = vec![];

    let state = State::with_sources(
        config,
        None,
        Box::new(table.clone()),
        Box::new(FixedProbe(big_memory())),
        Box::new(backend.clone()),
    )
    .unwrap();

    run_cycle(&state).await;
    assert_eq!(state.stats().await.num_exes, 1);

    // the binary disappears and its process exits
    table.set_processes(&[]);
    run_cycle(&state).await;
    std::fs::remove_file(&exe_path).unwrap();

    state.write().await.unwrap();

    let stats = state.stats().await;
    assert_eq!(stats.num_exes, 0);
    assert_eq!(stats.num_maps, 0);
}
