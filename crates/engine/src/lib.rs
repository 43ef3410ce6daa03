//! The adaptive prefetch engine: model, prediction, and readahead.

mod error;
mod exe;
mod exemap;
mod map;
mod markov;
pub mod memstat;
mod persistence;
pub mod prefetch;
pub mod proc;
mod state;
#[cfg(test)]
pub(crate) mod test_support;
pub mod utils;
mod vomm;

pub use error::Error;
pub use exe::{Exe, ExeForMarkov};
pub use exemap::ExeMap;
pub use map::{Map, RuntimeStats};
pub use markov::{Markov, MarkovState, MarkovStats};
pub use memstat::{MemStat, MemoryProbe};
pub use persistence::StateFileError;
pub use state::{ExeSnapshot, ModelStats, State};
pub use vomm::VommTree;
