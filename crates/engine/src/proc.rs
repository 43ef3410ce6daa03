use crate::Error;
use procfs::process::MMapPath;
use std::path::PathBuf;
use tracing::warn;

/// A file-backed mapping of a process, as read from the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMap {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Enumerates running processes and their file-backed mappings.
///
/// The engine never talks to `/proc` directly; everything goes through this
/// seam so the model can be exercised hermetically.
pub trait ProcessSource: Send + Sync {
    /// All `(pid, exe_path)` pairs currently alive. Paths are raw; the
    /// caller sanitizes and filters them.
    fn running_processes(&mut self) -> Result<Vec<(u32, PathBuf)>, Error>;

    /// The file-backed mappings of one pid. A pid that disappeared between
    /// enumeration and this call surfaces as an error the caller may ignore.
    fn process_maps(&mut self, pid: u32) -> Result<Vec<RawMap>, Error>;
}

/// Production implementation on top of procfs.
#[derive(Debug, Default)]
pub struct ProcfsSource;

impl ProcessSource for ProcfsSource {
    fn running_processes(&mut self) -> Result<Vec<(u32, PathBuf)>, Error> {
        let mut out = Vec::new();
        for process in procfs::process::all_processes()? {
            let process = match process {
                Ok(p) => p,
                Err(err) => {
                    warn!(?err, "failed to read process entry");
                    continue;
                }
            };
            let pid = process.pid as u32;
            match process.exe() {
                Ok(path) => out.push((pid, path)),
                // permission or the process is gone; both are routine
                Err(_) => continue,
            }
        }
        Ok(out)
    }

    fn process_maps(&mut self, pid: u32) -> Result<Vec<RawMap>, Error> {
        let process = procfs::process::Process::new(pid as i32)?;
        let maps = process.maps()?;
        let mut out = Vec::new();
        for map in maps {
            let MMapPath::Path(path) = map.pathname else {
                continue;
            };
            let (start, end) = map.address;
            out.push(RawMap {
                path,
                offset: map.offset,
                length: end.saturating_sub(start),
            });
        }
        Ok(out)
    }
}
