use nix::fcntl::PosixFadviseAdvice;
use nix::sys::mman::{MapFlags, MmapAdvise, ProtFlags};
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// The kernel-facing prefetch primitives.
///
/// Both calls are advisory. `map_and_advise` expects page-aligned
/// arguments; the controller aligns before falling back to it.
pub trait PrefetchBackend: Send + Sync {
    /// Ask the kernel to read the region into the page cache.
    fn readahead(&self, path: &Path, offset: u64, length: u64) -> io::Result<()>;

    /// Map the region read-only and mark it as soon-needed.
    fn map_and_advise(&self, path: &Path, offset: u64, length: u64) -> io::Result<()>;
}

/// Production backend: `posix_fadvise(WILLNEED)` with an
/// mmap/`madvise(MADV_WILLNEED)` escape hatch for filesystems that do not
/// implement fadvise-driven readahead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl SystemBackend {
    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NOATIME)
            .open(path)
    }
}

impl PrefetchBackend for SystemBackend {
    fn readahead(&self, path: &Path, offset: u64, length: u64) -> io::Result<()> {
        let file = Self::open(path)?;
        nix::fcntl::posix_fadvise(
            file.as_raw_fd(),
            offset as i64,
            length as i64,
            PosixFadviseAdvice::POSIX_FADV_WILLNEED,
        )
        .map_err(errno_to_io)
    }

    #[allow(unsafe_code)]
    fn map_and_advise(&self, path: &Path, offset: u64, length: u64) -> io::Result<()> {
        let file = Self::open(path)?;
        let length_nz = NonZeroUsize::new(length as usize)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: a fresh private read-only mapping, touched only by the
        // madvise below and unmapped before returning.
        let addr = unsafe {
            nix::sys::mman::mmap(
                None,
                length_nz,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                &file,
                offset as i64,
            )
        }
        .map_err(errno_to_io)?;

        // SAFETY: addr/length describe exactly the mapping created above.
        let advised = unsafe {
            nix::sys::mman::madvise(addr, length as usize, MmapAdvise::MADV_WILLNEED)
        };
        // SAFETY: unmapping the mapping created above, regardless of the
        // madvise outcome.
        let _ = unsafe { nix::sys::mman::munmap(addr, length as usize) };

        advised.map_err(errno_to_io)
    }
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn readahead_missing_file_errors() {
        let backend = SystemBackend;
        assert!(backend
            .readahead(Path::new("/nonexistent/definitely/missing"), 0, 16)
            .is_err());
    }

    #[test]
    fn readahead_does_not_change_access_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "payload bytes").unwrap();

        let before = std::fs::metadata(&path).unwrap().accessed().unwrap();
        SystemBackend.readahead(&path, 0, 8).unwrap();
        let after = std::fs::metadata(&path).unwrap().accessed().unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn map_and_advise_works_on_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, vec![7u8; 8192]).unwrap();

        SystemBackend.map_and_advise(&path, 0, 4096).unwrap();
    }
}
