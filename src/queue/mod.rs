//! Append-only queue: sink (writer) + source (reader) over time-named,
//! content-addressed, rotated files.

pub mod sink;
pub mod source;

pub use sink::Sink;
pub use source::Source;

/// Location of the next record to read: a (possibly hash-less) file-name
/// prefix, plus a 0-based in-file record index.
pub type Cursor = (String, usize);

pub const HASH_SEPARATOR: char = '_';

/// Split a queue file's relative-path basename into its timestamp prefix and
/// its finalization hash, if any (`"HHMMSS_deadbeef"` -> `("HHMMSS",
/// Some("deadbeef"))`, `"HHMMSS"` -> `("HHMMSS", None)`).
pub fn split_hash_suffix(basename: &str) -> (&str, Option<&str>) {
    match basename.rfind(HASH_SEPARATOR) {
        Some(idx) => (&basename[..idx], Some(&basename[idx + 1..])),
        None => (basename, None),
    }
}

/// Does `relative_path` (e.g. `"2026/07/27/153000_abcd"`) match
/// `file_prefix` (e.g. `"2026/07/27/153000"`), tolerating whether the
/// trailing hash suffix is present on either side?
pub fn matches_prefix(relative_path: &str, file_prefix: &str) -> bool {
    relative_path == file_prefix || relative_path.starts_with(file_prefix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_hash_suffix() {
        assert_eq!(split_hash_suffix("153000_abcd"), ("153000", Some("abcd")));
        assert_eq!(split_hash_suffix("153000"), ("153000", None));
    }

    #[test]
    fn prefix_matching_tolerates_hash() {
        assert!(matches_prefix("2026/07/27/153000_abcd", "2026/07/27/153000"));
        assert!(matches_prefix("2026/07/27/153000", "2026/07/27/153000"));
        assert!(!matches_prefix("2026/07/27/160000_abcd", "2026/07/27/153000"));
    }
}
