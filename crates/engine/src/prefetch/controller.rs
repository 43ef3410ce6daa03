use super::PrefetchBackend;
use crate::Map;
use config::{Config, SortStrategy};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

/// One coalesced readahead request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Sorts, coalesces, and submits prefetch requests with bounded
/// parallelism. Failures are advisory and never travel upward.
#[derive(Debug, Clone)]
pub struct PrefetchController {
    strategy: SortStrategy,
    processes: usize,
}

impl PrefetchController {
    pub fn new(config: &Config) -> Self {
        Self {
            strategy: config.system.sortstrategy,
            processes: config.system.processes,
        }
    }

    /// Submit the candidate maps. Returns the number of coalesced regions
    /// for which a prefetch primitive succeeded.
    pub fn readahead(&self, maps: &mut [Map], backend: &dyn PrefetchBackend) -> usize {
        self.sort_maps(maps);
        let requests = coalesce(maps);
        if requests.is_empty() {
            return 0;
        }

        let submitted = AtomicUsize::new(0);
        if self.processes == 0 {
            for request in &requests {
                if submit(request, backend) {
                    submitted.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            let workers = self.processes.min(requests.len());
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(|| {
                    requests.par_iter().for_each(|request| {
                        if submit(request, backend) {
                            submitted.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }),
                Err(err) => {
                    warn!(%err, "failed to build prefetch pool, running inline");
                    for request in &requests {
                        if submit(request, backend) {
                            submitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        let submitted = submitted.load(Ordering::Relaxed);
        debug!(
            candidates = maps.len(),
            regions = requests.len(),
            submitted,
            "readahead pass done"
        );
        submitted
    }

    fn sort_maps(&self, maps: &mut [Map]) {
        match self.strategy {
            SortStrategy::None => {}
            SortStrategy::Path => {
                maps.sort_by(|a, b| a.path_order(b));
            }
            SortStrategy::Inode | SortStrategy::Block => {
                let use_inode = self.strategy == SortStrategy::Inode;
                if maps.iter().any(|map| map.block().is_none()) {
                    // sort by path first to make the stat pass fast
                    maps.sort_by(|a, b| a.path_order(b));
                    for map in maps.iter().filter(|map| map.block().is_none()) {
                        if let Err(err) = map.set_block(use_inode) {
                            trace!(path = ?map.path(), %err, "failed to resolve block");
                        }
                    }
                }
                maps.sort_by(|a, b| a.block_order(b));
            }
        }
    }
}

/// Merge neighboring requests into the same file where the next offset
/// falls inside or right at the end of the running region.
pub(crate) fn coalesce(maps: &[Map]) -> Vec<Request> {
    let mut requests: Vec<Request> = Vec::new();

    for map in maps {
        if let Some(last) = requests.last_mut() {
            if last.path == map.path()
                && last.offset <= map.offset()
                && map.offset() <= last.offset + last.length
            {
                last.length = map.offset() + map.length() - last.offset;
                continue;
            }
        }
        requests.push(Request {
            path: map.path().to_path_buf(),
            offset: map.offset(),
            length: map.length(),
        });
    }

    requests
}

fn submit(request: &Request, backend: &dyn PrefetchBackend) -> bool {
    match backend.readahead(&request.path, request.offset, request.length) {
        Ok(()) => {
            trace!(?request, "readahead done");
            true
        }
        Err(err) if is_unsupported(&err) => {
            let (offset, length) = page_align(request.offset, request.length);
            match backend.map_and_advise(&request.path, offset, length) {
                Ok(()) => true,
                Err(err) => {
                    // pseudo-filesystems refuse mapping; that is fine
                    debug!(path = ?request.path, %err, "willneed advisory failed");
                    false
                }
            }
        }
        Err(err) => {
            debug!(path = ?request.path, %err, "readahead failed");
            false
        }
    }
}

fn is_unsupported(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
    )
}

fn page_size() -> u64 {
    procfs::page_size()
}

/// Align the region outward to page boundaries, as mmap requires.
fn page_align(offset: u64, length: u64) -> (u64, u64) {
    let page = page_size();
    let aligned_offset = offset & !(page - 1);
    let padded = length + (offset - aligned_offset);
    let aligned_length = padded.div_ceil(page) * page;
    (aligned_offset, aligned_length)
}
