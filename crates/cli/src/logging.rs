use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// Log sink that can be pointed at a new file on config reload.
///
/// With no file attached, output goes to stderr.
#[derive(Debug, Clone, Default)]
pub struct LogWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl LogWriter {
    pub fn new(path: Option<&Path>) -> io::Result<Self> {
        let writer = Self::default();
        if let Some(path) = path {
            writer.reopen(path)?;
        }
        Ok(writer)
    }

    /// Open (or re-open) the log file, appending.
    pub fn reopen(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.file.lock() = Some(file);
        Ok(())
    }
}

pub struct LogGuard<'a>(MutexGuard<'a, Option<File>>);

impl Write for LogGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.0 {
            Some(file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.0 {
            Some(file) => file.flush(),
            None => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogGuard(self.file.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_switches_target() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.log");
        let second = dir.path().join("b.log");

        let writer = LogWriter::new(Some(&first)).unwrap();
        writer.make_writer().write_all(b"one\n").unwrap();

        writer.reopen(&second).unwrap();
        writer.make_writer().write_all(b"two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&first).unwrap(), "one\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "two\n");
    }
}
