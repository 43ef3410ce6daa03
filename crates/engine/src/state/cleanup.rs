//! Post-save removal of model entries whose files are gone.

use super::inner::StateInner;
use crate::{Exe, Map};
use std::path::Path;
use tracing::{debug, info};

/// Outcome of checking a model entry against the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validity {
    Valid,
    Missing,
}

fn validate_exe(path: &Path) -> Validity {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Validity::Valid,
        Ok(_) => Validity::Missing,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Validity::Missing,
        // permission or transient trouble: assume still valid
        Err(_) => Validity::Valid,
    }
}

fn validate_map(path: &Path) -> Validity {
    // pseudo-filesystems are always "valid" even if not stat-able
    if path.starts_with("/proc/") || path.starts_with("/sys/") || path.starts_with("/dev/") {
        return Validity::Valid;
    }
    match std::fs::metadata(path) {
        Ok(_) => Validity::Valid,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Validity::Missing,
        Err(_) => Validity::Valid,
    }
}

impl StateInner {
    /// Drop exes and maps whose backing files have disappeared. Running
    /// exes are never touched. Returns the number of removed entries.
    pub(crate) fn cleanup_stale(&mut self) -> usize {
        let mut removed = 0;

        let stale_exes: Vec<Exe> = self
            .exes
            .values()
            .filter(|exe| !exe.is_running(self.last_running_timestamp))
            .filter(|exe| validate_exe(&exe.path()) == Validity::Missing)
            .cloned()
            .collect();

        for exe in stale_exes {
            info!(path = ?exe.path(), "removing deleted executable from model");
            match self.unregister_exe(&exe) {
                Ok(()) => removed += 1,
                Err(err) => debug!(%err, "failed to unregister stale exe"),
            }
        }

        let dead_maps: Vec<Map> = self
            .maps
            .iter()
            .filter(|map| validate_map(map.path()) == Validity::Missing)
            .cloned()
            .collect();

        if !dead_maps.is_empty() {
            let exes: Vec<Exe> = self.exes.values().cloned().collect();
            for map in &dead_maps {
                debug!(path = ?map.path(), "removing deleted map from model");
                for exe in &exes {
                    let dropped = exe.retain_exemaps(|exemap| exemap.map != *map);
                    for dropped_map in dropped {
                        self.map_unref(&dropped_map);
                    }
                }
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "cleaned up stale entries from model");
        }
        removed
    }
}
