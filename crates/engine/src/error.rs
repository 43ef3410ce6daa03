use std::path::PathBuf;

/// Represents all possible errors that can occur in this crate.
///
/// Only [`CorrelationOutOfRange`](Error::CorrelationOutOfRange) and
/// [`ExeMarkovDropped`](Error::ExeMarkovDropped) are model-invariant
/// violations that should take the daemon down; everything else is expected
/// to be recovered close to where it happens.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error occurred while loading the configuration file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(#[from] config::Error),

    /// Error occurred while reading data from procfs.
    #[error("Failed to read procfs info: {0}")]
    ProcfsReadFailed(#[from] procfs::ProcError),

    /// Error occurred while performing I/O on a file.
    #[error("Failed to perform I/O operation on file: {0}")]
    FileIOFailed(#[from] std::io::Error),

    /// An exe referenced by a markov chain has been deallocated while the
    /// chain was still alive.
    #[error("Exe associated with markov has been deallocated")]
    ExeMarkovDropped,

    /// A computed correlation coefficient left the mathematically possible
    /// range, meaning the running-time bookkeeping is corrupt.
    #[error("Correlation coefficient {value} outside [-1, 1]")]
    CorrelationOutOfRange { value: f64 },

    /// The exe with this path is already registered.
    #[error("Exe {0:?} is already registered")]
    ExeAlreadyRegistered(PathBuf),

    /// Error occurred while reading or writing the state file.
    #[error("State file error: {0}")]
    StateFile(#[from] crate::persistence::StateFileError),
}
