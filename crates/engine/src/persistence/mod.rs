//! Durable state: a versioned, tag-oriented text format.
//!
//! The file is UTF-8 text, one record per line, fields separated by a single
//! tab. The first non-comment line is the `PRELOAD` header carrying the
//! version and the model time; `MAP`, `BADEXE`, `EXE`, `EXEMAP`, and
//! `MARKOV` sections follow. Paths are percent-escaped file URIs. Writes go
//! to `<path>.tmp` followed by an atomic rename.

mod uri;

use crate::state::StateInner;
use crate::{Error, Exe, ExeMap, Map, Markov};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::{debug, info, warn};

const TAG_PRELOAD: &str = "PRELOAD";
const TAG_MAP: &str = "MAP";
const TAG_BADEXE: &str = "BADEXE";
const TAG_EXE: &str = "EXE";
const TAG_EXEMAP: &str = "EXEMAP";
const TAG_MARKOV: &str = "MARKOV";

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum StateFileError {
    #[error("line {line}: invalid tag")]
    Tag { line: usize },

    #[error("line {line}: invalid syntax")]
    Syntax { line: usize },

    #[error("line {line}: invalid index")]
    Index { line: usize },

    #[error("line {line}: duplicate index")]
    DuplicateIndex { line: usize },

    #[error("line {line}: duplicate object")]
    DuplicateObject { line: usize },

    #[error("line {line}: invalid file URI")]
    Uri { line: usize },

    #[error("missing {TAG_PRELOAD} header")]
    MissingHeader,

    #[error("state file version {found} is newer than running version {running}")]
    VersionNewer { found: String, running: String },
}

/// Write the whole model to `writer`.
///
/// Sections are emitted in sequence order so identical models produce
/// identical bytes.
pub(crate) fn write_state(inner: &StateInner, writer: &mut impl Write) -> Result<(), Error> {
    writeln!(writer, "{TAG_PRELOAD}\t{VERSION}\t{}", inner.time)?;

    let mut maps: Vec<&Map> = inner.maps.iter().collect();
    maps.sort_by_key(|map| map.seq());
    for map in maps {
        let Some(seq) = map.seq() else { continue };
        writeln!(
            writer,
            "{TAG_MAP}\t{seq}\t{}\t{}\t{}\t-1\t{}",
            map.update_time(),
            map.offset(),
            map.length(),
            uri::encode(map.path()),
        )?;
    }

    let mut bad_exes: Vec<(&std::path::PathBuf, &u64)> = inner.bad_exes.iter().collect();
    bad_exes.sort();
    for (path, size) in bad_exes {
        writeln!(writer, "{TAG_BADEXE}\t{size}\t-1\t{}", uri::encode(path))?;
    }

    let mut exes: Vec<&Exe> = inner.exes.values().collect();
    exes.sort_by_key(|exe| exe.seq());
    for exe in &exes {
        let Some(seq) = exe.seq() else { continue };
        let update_time = exe
            .update_time()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-1".into());
        writeln!(
            writer,
            "{TAG_EXE}\t{seq}\t{update_time}\t{}\t-1\t{}",
            exe.time(),
            uri::encode(&exe.path()),
        )?;
    }

    for exe in &exes {
        let Some(exe_seq) = exe.seq() else { continue };
        for exemap in exe.exemaps() {
            let Some(map_seq) = exemap.map.seq() else {
                continue;
            };
            writeln!(writer, "{TAG_EXEMAP}\t{exe_seq}\t{map_seq}\t{}", exemap.prob)?;
        }
    }

    let mut io_error: Option<std::io::Error> = None;
    for exe in &exes {
        exe.foreach_markov(|markov| {
            if io_error.is_some() {
                return Ok(());
            }
            if let Err(err) = write_markov(markov, writer) {
                io_error = Some(err);
            }
            Ok(())
        })?;
    }
    if let Some(err) = io_error {
        return Err(err.into());
    }

    Ok(())
}

fn write_markov(markov: &Markov, writer: &mut impl Write) -> std::io::Result<()> {
    let Ok((Some(a_seq), Some(b_seq))) = markov.seqs() else {
        return Ok(());
    };
    let stats = markov.stats();

    write!(writer, "{TAG_MARKOV}\t{a_seq}\t{b_seq}\t{}", stats.time)?;
    for ttl in stats.time_to_leave {
        write!(writer, "\t{ttl}")?;
    }
    for row in stats.weight {
        for weight in row {
            write!(writer, "\t{weight}")?;
        }
    }
    writeln!(writer)
}

/// Populate a fresh model from `reader`.
///
/// On any error the file is unusable as a whole and the caller discards the
/// partially populated model.
pub(crate) fn read_state(inner: &mut StateInner, reader: impl BufRead) -> Result<(), Error> {
    let mut maps_by_index: HashMap<u64, Map> = HashMap::new();
    let mut exes_by_index: HashMap<u64, Exe> = HashMap::new();
    let mut max_map_seq: Option<u64> = None;
    let mut max_exe_seq: Option<u64> = None;
    let mut seen_header = false;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let lineno = lineno + 1;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        let tag = fields[0];

        if !seen_header {
            if tag != TAG_PRELOAD {
                return Err(StateFileError::MissingHeader.into());
            }
            let [version, time] = require_fields(&fields, lineno)?;
            match check_version(version) {
                VersionCheck::Compatible => {}
                VersionCheck::FileOlder => {
                    warn!(
                        found = version,
                        running = VERSION,
                        "state file is from an old version I no longer understand, ignoring it"
                    );
                    return Ok(());
                }
                VersionCheck::FileNewer => {
                    return Err(StateFileError::VersionNewer {
                        found: version.to_string(),
                        running: VERSION.to_string(),
                    }
                    .into());
                }
                VersionCheck::Unparsable => {
                    return Err(StateFileError::Syntax { line: lineno }.into());
                }
            }
            let time: u64 = parse(time, lineno)?;
            inner.time = time;
            inner.last_accounting_timestamp = time;
            seen_header = true;
            continue;
        }

        match tag {
            TAG_PRELOAD => return Err(StateFileError::Syntax { line: lineno }.into()),
            TAG_MAP => {
                let [seq, update_time, offset, length, _expansion, file_uri] =
                    require_fields(&fields, lineno)?;
                let seq: u64 = parse(seq, lineno)?;
                let update_time: u64 = parse(update_time, lineno)?;
                let offset: u64 = parse(offset, lineno)?;
                let length: u64 = parse(length, lineno)?;
                let path =
                    uri::decode(file_uri).ok_or(StateFileError::Uri { line: lineno })?;

                let map = Map::new(path, offset, length, update_time);
                if maps_by_index.contains_key(&seq) {
                    return Err(StateFileError::DuplicateIndex { line: lineno }.into());
                }
                if maps_by_index.values().any(|existing| *existing == map) {
                    return Err(StateFileError::DuplicateObject { line: lineno }.into());
                }
                map.set_seq(seq);
                max_map_seq = Some(max_map_seq.map_or(seq, |m| m.max(seq)));
                maps_by_index.insert(seq, map);
            }
            TAG_BADEXE => {
                // deliberately not read back in: bad exes get another chance
                // on every restart
            }
            TAG_EXE => {
                let [seq, update_time, time, _expansion, file_uri] =
                    require_fields(&fields, lineno)?;
                let seq: u64 = parse(seq, lineno)?;
                let update_time: i64 = parse(update_time, lineno)?;
                let time: u64 = parse(time, lineno)?;
                let path =
                    uri::decode(file_uri).ok_or(StateFileError::Uri { line: lineno })?;

                if exes_by_index.contains_key(&seq) {
                    return Err(StateFileError::DuplicateIndex { line: lineno }.into());
                }
                if inner.exes.contains_key(&path) {
                    return Err(StateFileError::DuplicateObject { line: lineno }.into());
                }

                let exe = Exe::new(path);
                exe.set_seq(seq);
                exe.set_time(time);
                if let Ok(update_time) = u64::try_from(update_time) {
                    exe.set_update_time(update_time);
                }
                max_exe_seq = Some(max_exe_seq.map_or(seq, |m| m.max(seq)));
                inner.register_exe(exe.clone(), false)?;
                exes_by_index.insert(seq, exe);
            }
            TAG_EXEMAP => {
                let [exe_seq, map_seq, prob] = require_fields(&fields, lineno)?;
                let exe_seq: u64 = parse(exe_seq, lineno)?;
                let map_seq: u64 = parse(map_seq, lineno)?;
                let prob: f64 = parse(prob, lineno)?;

                let exe = exes_by_index
                    .get(&exe_seq)
                    .ok_or(StateFileError::Index { line: lineno })?;
                let map = maps_by_index
                    .get(&map_seq)
                    .ok_or(StateFileError::Index { line: lineno })?;

                inner.map_ref(map);
                exe.add_exemap(ExeMap::new(map.clone()).with_prob(prob));
            }
            TAG_MARKOV => {
                if fields.len() != 1 + 3 + 4 + 16 {
                    return Err(StateFileError::Syntax { line: lineno }.into());
                }
                let a_seq: u64 = parse(fields[1], lineno)?;
                let b_seq: u64 = parse(fields[2], lineno)?;
                let time: u64 = parse(fields[3], lineno)?;

                let mut time_to_leave = [0f64; 4];
                for (slot, field) in time_to_leave.iter_mut().zip(&fields[4..8]) {
                    *slot = parse(field, lineno)?;
                }
                let mut weight = [[0u32; 4]; 4];
                for (row, chunk) in weight.iter_mut().zip(fields[8..24].chunks(4)) {
                    for (slot, field) in row.iter_mut().zip(chunk) {
                        *slot = parse(field, lineno)?;
                    }
                }

                let a = exes_by_index
                    .get(&a_seq)
                    .ok_or(StateFileError::Index { line: lineno })?;
                let b = exes_by_index
                    .get(&b_seq)
                    .ok_or(StateFileError::Index { line: lineno })?;

                let markov = Markov::new(a.for_markov(), b.for_markov()).linked()?;
                markov.set_stats(time, time_to_leave, weight);
            }
            _ => return Err(StateFileError::Tag { line: lineno }.into()),
        }
    }

    if !seen_header && (!maps_by_index.is_empty() || !exes_by_index.is_empty()) {
        return Err(StateFileError::MissingHeader.into());
    }

    inner.map_seq = max_map_seq.map_or(0, |m| m + 1);
    inner.exe_seq = max_exe_seq.map_or(0, |m| m + 1);

    let last_running_timestamp = inner.last_running_timestamp;
    inner.markov_foreach(|markov| markov.set_state(last_running_timestamp))?;

    debug!(
        num_exes = inner.exes.len(),
        num_maps = inner.maps.len(),
        time = inner.time,
        "state loaded"
    );
    Ok(())
}

enum VersionCheck {
    Compatible,
    FileOlder,
    FileNewer,
    Unparsable,
}

fn major(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}

fn check_version(found: &str) -> VersionCheck {
    let (Some(found_major), Some(running_major)) = (major(found), major(VERSION)) else {
        return VersionCheck::Unparsable;
    };
    match found_major.cmp(&running_major) {
        std::cmp::Ordering::Equal => VersionCheck::Compatible,
        std::cmp::Ordering::Less => VersionCheck::FileOlder,
        std::cmp::Ordering::Greater => VersionCheck::FileNewer,
    }
}

fn require_fields<'a, const N: usize>(
    fields: &[&'a str],
    line: usize,
) -> Result<[&'a str; N], StateFileError> {
    fields[1..]
        .try_into()
        .map_err(|_| StateFileError::Syntax { line })
}

fn parse<T: std::str::FromStr>(field: &str, line: usize) -> Result<T, StateFileError> {
    field
        .parse()
        .map_err(|_| StateFileError::Syntax { line })
}

/// Write the model to `<statefile>.tmp` and atomically rename it over the
/// statefile. A failed write unlinks the temporary and leaves the previous
/// file untouched.
pub(crate) fn save_state(inner: &StateInner, statefile: &Path) -> Result<(), Error> {
    info!(path = ?statefile, "saving state");

    let mut tmpfile = statefile.as_os_str().to_os_string();
    tmpfile.push(".tmp");
    let tmpfile = std::path::PathBuf::from(tmpfile);

    let result = (|| -> Result<(), Error> {
        let file = std::fs::File::create(&tmpfile)?;
        let mut writer = std::io::BufWriter::new(file);
        write_state(inner, &mut writer)?;
        writer.flush()?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmpfile);
        return Err(err);
    }

    if let Err(err) = std::fs::rename(&tmpfile, statefile) {
        let _ = std::fs::remove_file(&tmpfile);
        return Err(err.into());
    }

    debug!("saving state done");
    Ok(())
}

/// Load the model from `statefile` if it exists. A missing file yields an
/// empty model; an unusable one is reported for the caller to discard.
pub(crate) fn load_state(inner: &mut StateInner, statefile: &Path) -> Result<(), Error> {
    let file = match std::fs::File::open(statefile) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = ?statefile, "no state file, starting fresh");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    info!(path = ?statefile, "loading state");
    read_state(inner, std::io::BufReader::new(file))
}
