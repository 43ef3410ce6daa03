use crate::Error;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::os::linux::fs::MetadataExt;
use std::path::PathBuf;

/// Runtime statistics of a map. Not part of the map's identity and not
/// persisted except for `seq`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeStats {
    /// Log-probability of the map NOT being needed in the next period.
    pub lnprob: f64,

    /// Unique map sequence number, assigned on registration.
    pub seq: Option<u64>,

    /// On-disk location of the start of the map. `None` = not yet resolved.
    pub block: Option<u64>,

    /// Number of exemaps referencing this map.
    pub refcount: u32,
}

#[derive(Debug, Default)]
pub(super) struct MapInner {
    /// Absolute path of the mapped file.
    pub(super) path: PathBuf,

    /// Offset of the mapped section in bytes.
    pub(super) offset: u64,

    /// Length of the mapped section in bytes.
    pub(super) length: u64,

    /// Last time the map was probed.
    pub(super) update_time: u64,

    pub(super) runtime: Mutex<RuntimeStats>,
}

// Identity is the (path, offset, length) triple; update_time and runtime
// stats do not participate.
impl PartialEq for MapInner {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.offset == other.offset && self.length == other.length
    }
}

impl Eq for MapInner {}

impl Hash for MapInner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.offset.hash(state);
        self.length.hash(state);
    }
}

impl MapInner {
    pub(super) fn new(path: impl Into<PathBuf>, offset: u64, length: u64, update_time: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
            update_time,
            ..Default::default()
        }
    }

    pub(super) fn set_block(&self, use_inode: bool) -> Result<(), Error> {
        // in case we cannot resolve a block, keep 0 so we do not retry
        self.runtime.lock().block = Some(0);

        let file = std::fs::File::open(&self.path)?;
        let meta = file.metadata()?;

        if !use_inode {
            if let Some(block) = fibmap::first_block(&file, self.offset, meta.st_blksize()) {
                self.runtime.lock().block = Some(block);
                return Ok(());
            }
        }

        self.runtime.lock().block = Some(meta.st_ino());
        Ok(())
    }
}

mod fibmap {
    use std::fs::File;
    use std::os::fd::AsRawFd;

    // FIBMAP = _IO(0x00, 1); takes a logical block number in a c_int and
    // replaces it with the physical block number. Needs CAP_SYS_RAWIO and a
    // filesystem that implements bmap; anything else yields None.
    const FIBMAP: libc::c_ulong = 1;

    pub(super) fn first_block(file: &File, offset: u64, blksize: u64) -> Option<u64> {
        if blksize == 0 {
            return None;
        }
        let mut block = libc::c_int::try_from(offset / blksize).ok()?;
        // SAFETY: FIBMAP reads and writes a single c_int that lives on this
        // frame for the duration of the call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FIBMAP as _, &mut block) };
        if rc < 0 || block <= 0 {
            None
        } else {
            Some(block as u64)
        }
    }
}
