use std::path::Path;

/// Check whether a file path is accepted by a prefix list.
///
/// Entries starting with `!` deny, everything else accepts. The entry with
/// the longest matching prefix decides; a path matching no entry is
/// accepted. List order does not matter.
///
/// # Examples
///
/// ```
/// # use engine::utils::accept_file;
/// let prefixes = [
///     "!/home/user/personal",
///     "/home/user/personal/allowed",
///     "/usr/bin",
/// ];
///
/// assert!(accept_file("/usr/bin/ls", &prefixes));
/// assert!(!accept_file("/home/user/personal/secret", &prefixes));
/// // the longer accept entry overrides the deny around it
/// assert!(accept_file("/home/user/personal/allowed/file", &prefixes));
/// // a path matching nothing is accepted
/// assert!(accept_file("/no/match", &prefixes));
/// ```
#[inline]
pub fn accept_file<T, U>(path: impl AsRef<Path>, prefixes: T) -> bool
where
    T: IntoIterator<Item = U>,
    U: AsRef<str>,
{
    let path = path.as_ref();

    let verdict = prefixes
        .into_iter()
        .fold(None, |best: Option<(usize, bool)>, entry| {
            let entry = entry.as_ref();
            let (deny, prefix) = match entry.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, entry),
            };
            if !path.starts_with(Path::new(prefix)) {
                return best;
            }
            match best {
                // on equal lengths the earlier entry keeps its verdict
                Some((len, _)) if len >= prefix.len() => best,
                _ => Some((prefix.len(), deny)),
            }
        });

    match verdict {
        Some((_, deny)) => !deny,
        None => true,
    }
}

/// Sanitize a file path read from `/proc`.
///
/// Relative paths and `(deleted)` entries are rejected; a prelink suffix is
/// stripped.
///
/// # Examples
///
/// ```
/// # use engine::utils::sanitize_file;
/// # use std::path::Path;
/// let path = Path::new("/bin/bash.#prelink#.12345");
/// assert_eq!(sanitize_file(path), Some(Path::new("/bin/bash")));
///
/// assert_eq!(sanitize_file(Path::new("/usr/bin/bash(deleted)")), None);
/// assert_eq!(sanitize_file(Path::new("relative/path")), None);
/// ```
#[inline]
pub fn sanitize_file(path: &Path) -> Option<&Path> {
    if !path.has_root() {
        return None;
    }
    let s = path.to_str()?;
    if s.contains("(deleted)") {
        return None;
    }
    // convert /bin/bash.#prelink#.12345 to /bin/bash
    let trimmed = s.split(".#prelink#.").next()?;
    Some(Path::new(trimmed))
}

/// Convert bytes to kilobytes, rounding up.
///
/// # Examples
///
/// ```
/// # use engine::utils::kb;
/// assert_eq!(kb(0), 0);
/// assert_eq!(kb(1023), 1);
/// assert_eq!(kb(1024), 1);
/// assert_eq!(kb(1025), 2);
/// ```
pub const fn kb(x: u64) -> u64 {
    x.div_ceil(1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn accept_file_with_complex_prefixes() {
        let prefixes = [
            "/usr/local/bin",
            "!/usr/local",
            "/usr/local/bin/accepted",
            "!/usr/local/bin/rejected",
        ];

        assert!(accept_file("/usr/local/bin/accepted/file", prefixes));
        assert!(!accept_file("/usr/local/bin/rejected/file", prefixes));
        assert!(!accept_file("/usr/local/other", prefixes));
        assert!(accept_file("/usr/local/bin/other", prefixes));
        assert!(accept_file("/usr/bin/ls", &[] as &[&str]));
    }

    #[test]
    fn longest_match_decides_regardless_of_order() {
        assert!(!accept_file("/opt/app/bin/x", ["/opt/", "!/opt/app/"]));
        assert!(!accept_file("/opt/app/bin/x", ["!/opt/app/", "/opt/"]));
        assert!(accept_file("/opt/other/x", ["/opt/", "!/opt/app/"]));
    }

    #[test]
    fn sanitize_rejects_deleted_and_relative() {
        assert_eq!(
            sanitize_file(Path::new("/bin/bash.#prelink#.12345")),
            Some(Path::new("/bin/bash"))
        );
        assert_eq!(sanitize_file(Path::new("/bin/bash")), Some(Path::new("/bin/bash")));
        assert_eq!(sanitize_file(Path::new("/bin/bash(deleted)")), None);
        assert_eq!(sanitize_file(Path::new("relative/path")), None);
    }

    proptest! {
        // Matches a straightforward reference implementation.
        #[test]
        fn accept_file_matches_reference(
            prefixes in prop::collection::vec(prefix_strategy(), 0..10),
            path in path_strategy(),
        ) {
            let expected = reference_accept(&path, &prefixes);
            prop_assert_eq!(accept_file(Path::new(&path), &prefixes), expected);
        }
    }

    fn segment_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(97u8..=122, 1..8)
            .prop_map(|bytes| bytes.into_iter().map(|b| b as char).collect())
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(segment_strategy(), 1..6)
            .prop_map(|segments| format!("/{}", segments.join("/")))
    }

    fn prefix_strategy() -> impl Strategy<Value = String> {
        (any::<bool>(), prop::collection::vec(segment_strategy(), 1..6)).prop_map(
            |(negate, segments)| {
                let prefix = format!("/{}", segments.join("/"));
                if negate { format!("!{prefix}") } else { prefix }
            },
        )
    }

    // naive oracle: track the longest match with plain mutable state
    fn reference_accept(path: &str, prefixes: &[String]) -> bool {
        let mut best_len = 0usize;
        let mut accepted = true;
        for prefix in prefixes {
            let denied = prefix.starts_with('!');
            let raw = prefix.trim_start_matches('!');
            let matches = Path::new(path).starts_with(Path::new(raw));
            if matches && raw.len() > best_len {
                best_len = raw.len();
                accepted = !denied;
            }
        }
        accepted
    }
}
