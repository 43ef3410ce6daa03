use crate::Error;
use procfs::{Current, Meminfo};

/// A snapshot of system memory counters, in kilobytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemStat {
    pub total: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub available: u64,
}

/// Source of memory statistics. Abstract so tests can fix the numbers.
pub trait MemoryProbe: Send + Sync {
    fn memstat(&mut self) -> Result<MemStat, Error>;
}

/// Reads `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct ProcfsMemoryProbe;

impl MemoryProbe for ProcfsMemoryProbe {
    fn memstat(&mut self) -> Result<MemStat, Error> {
        let mem = Meminfo::current()?;
        Ok(MemStat {
            total: mem.mem_total / 1024,
            free: mem.mem_free / 1024,
            buffers: mem.buffers / 1024,
            cached: mem.cached / 1024,
            available: mem.mem_available.unwrap_or(mem.mem_free + mem.cached) / 1024,
        })
    }
}

/// A probe that always returns the same snapshot.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub MemStat);

impl MemoryProbe for FixedMemoryProbe {
    fn memstat(&mut self) -> Result<MemStat, Error> {
        Ok(self.0)
    }
}
