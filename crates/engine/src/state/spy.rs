//! Data acquisition: which exes run, which stopped, what is new.

use super::inner::StateInner;
use crate::{
    Error, Exe, ExeMap,
    utils::{accept_file, sanitize_file},
};
use std::{
    mem,
    path::{Path, PathBuf},
};
use tracing::{debug, trace, warn};

impl StateInner {
    /// Scan processes: see which exes started running, which are not
    /// running anymore, and what new exes are around.
    #[tracing::instrument(skip(self))]
    pub(crate) fn spy_scan(&mut self) -> Result<(), Error> {
        self.new_running_exes.clear();
        self.state_changed_exes.clear();
        self.new_exes.clear();

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
            self.running_process_callback(pid, path);
        }

        // every exe seen above carries a fresh timestamp now
        self.last_running_timestamp = self.time;

        // figure out who's not running anymore by checking timestamps
        let running_exes = mem::take(&mut self.running_exes);
        trace!(
            num_running_exes = running_exes.len(),
            "running exes found during scan"
        );
        for exe in running_exes {
            self.update_exe_list(exe);
        }

        self.running_exes = mem::take(&mut self.new_running_exes);
        Ok(())
    }

    /// For one observed process, decide whether it is a known exe changing
    /// state or something to queue for admission.
    fn running_process_callback(&mut self, pid: u32, exe_path: &Path) {
        if let Some(exe) = self.exes.get(exe_path).cloned() {
            if !exe.is_running(self.last_running_timestamp) {
                self.new_running_exes.push_back(exe.clone());
                self.state_changed_exes.push_back(exe.clone());
                self.vomm.update(exe_path);
            }
            exe.update_running_timestamp(self.time);
        } else if !self.bad_exes.contains_key(exe_path) {
            // an exe we have never seen before, just queue it
            self.new_exes.insert(exe_path.to_path_buf(), pid);
        }
    }

    /// Sort a previously running exe into survivors and stoppers.
    fn update_exe_list(&mut self, exe: Exe) {
        if exe.is_running(self.last_running_timestamp) {
            self.new_running_exes.push_back(exe);
        } else {
            self.state_changed_exes.push_back(exe);
        }
    }

    /// Fold the latest scan into the model. Runs half a cycle after the
    /// scan.
    #[tracing::instrument(skip(self))]
    pub(crate) fn spy_update_model(&mut self) -> Result<(), Error> {
        // register newly discovered exes first, so their chains initialize
        // before any change timestamps advance
        let new_exes = mem::take(&mut self.new_exes);
        debug!(num_new_exes = new_exes.len(), "registering new exes");
        for (path, pid) in new_exes {
            self.new_exe_callback(path, pid)?;
        }

        // adjust state for exes that changed running status
        let state_changed_exes = mem::take(&mut self.state_changed_exes);
        trace!(num = state_changed_exes.len(), "exes that changed state");
        for exe in &state_changed_exes {
            exe.update_change_timestamp(self.time);
            exe.markov_state_changed(self.time, self.last_running_timestamp)?;
        }

        // accounting
        let period = self.time - self.last_accounting_timestamp;
        for exe in self.exes.values() {
            if exe.is_running(self.last_running_timestamp) {
                exe.increase_time(period);
            }
        }
        for exe in self.exes.values() {
            exe.increase_markov_time(period)?;
        }
        self.last_accounting_timestamp = self.time;
        Ok(())
    }

    /// Probe a queued exe and either admit it into the model or blacklist
    /// it as too small.
    #[tracing::instrument(skip(self, path), fields(path = ?path))]
    fn new_exe_callback(&mut self, path: PathBuf, pid: u32) -> Result<(), Error> {
        let raw_maps = match self.proc_source.process_maps(pid) {
            Ok(maps) => maps,
            // pid disappeared between enumeration and now
            Err(_) => return Ok(()),
        };

        let mut accepted = Vec::new();
        let mut size = 0u64;
        for raw in raw_maps {
            let Some(map_path) = sanitize_file(&raw.path) else {
                continue;
            };
            if !accept_file(map_path, &self.config.system.mapprefix) {
                continue;
            }
            size += raw.length;
            accepted.push((map_path.to_path_buf(), raw.offset, raw.length));
        }

        if size < self.config.model.minsize {
            trace!(size, "exe is too small to be considered");
            self.bad_exes.insert(path, size);
            return Ok(());
        }
        if accepted.is_empty() {
            warn!("exe has no maps, maybe the process died?");
            return Ok(());
        }

        let mut exemaps = Vec::with_capacity(accepted.len());
        for (map_path, offset, length) in accepted {
            let map = self.intern_map(map_path, offset, length);
            self.map_ref(&map);
            exemaps.push(ExeMap::new(map));
        }

        let exe = Exe::new(&path)
            .with_running(self.last_running_timestamp)
            .with_change_timestamp(self.time)
            .with_exemaps(exemaps);
        self.register_exe(exe.clone(), true)?;
        self.running_exes.push_front(exe);
        self.vomm.update(&path);

        Ok(())
    }
}
