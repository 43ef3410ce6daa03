//! Minimal file-URI codec for state-file paths.
//!
//! Paths are stored as `file://`-prefixed, percent-escaped byte strings so
//! that embedded whitespace survives the tab-separated format.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'/')
}

pub(crate) fn encode(path: &Path) -> String {
    let mut out = String::from("file://");
    for &byte in path.as_os_str().as_bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub(crate) fn decode(uri: &str) -> Option<PathBuf> {
    let rest = uri.strip_prefix("file://")?;
    let bytes = rest.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    if out.first() != Some(&b'/') {
        return None;
    }
    Some(PathBuf::from(OsString::from_vec(out)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn plain_path_round_trips() {
        let path = Path::new("/usr/bin/env");
        assert_eq!(encode(path), "file:///usr/bin/env");
        assert_eq!(decode(&encode(path)).unwrap(), path);
    }

    #[test]
    fn spaces_and_tabs_are_escaped() {
        let path = Path::new("/opt/My App/bin\tname");
        let uri = encode(path);
        assert!(!uri.contains(' '));
        assert!(!uri.contains('\t'));
        assert_eq!(decode(&uri).unwrap(), path);
    }

    #[test]
    fn rejects_non_file_uris_and_relative_paths() {
        assert_eq!(decode("http://example.com/x"), None);
        assert_eq!(decode("file://relative/path"), None);
    }

    proptest! {
        #[test]
        fn arbitrary_absolute_paths_round_trip(tail in "[ -~]{0,40}") {
            let path = PathBuf::from(format!("/{tail}"));
            prop_assert_eq!(decode(&encode(&path)).unwrap(), path);
        }
    }
}
