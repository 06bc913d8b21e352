//! Snapshot catalog: parsing directory listings into basename sets and
//! computing common-ancestor relationships between them.

use std::collections::BTreeSet;

/// A snapshot basename must be `[PREFIX]YYYYMMDD-HHMMSS`: the configured
/// prefix followed by exactly 15 characters, `YYYYMMDD-HHMMSS`.
pub fn is_valid_basename(name: &str, prefix: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix) else {
        return false;
    };

    if rest.len() != 15 || rest.as_bytes()[8] != b'-' {
        return false;
    }

    rest[..8].bytes().all(|b| b.is_ascii_digit()) && rest[9..].bytes().all(|b| b.is_ascii_digit())
}

/// Filter an arbitrary name iterator down to basenames that match the active
/// prefix, returning them as the ordered set the rest of the crate works
/// with (basename ordering equals temporal ordering within one prefix).
pub fn filter_basenames(names: impl IntoIterator<Item = String>, prefix: &str) -> BTreeSet<String> {
    names
        .into_iter()
        .filter(|name| is_valid_basename(name, prefix))
        .collect()
}

/// The incremental parent for `basename`: the lexicographically greatest
/// entry of `common` that sorts strictly before `basename`, or `None` for a
/// full send.
pub fn parent_for(common: &BTreeSet<String>, basename: &str) -> Option<String> {
    common
        .range::<str, _>(..basename)
        .next_back()
        .map(String::clone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_basenames() {
        assert!(is_valid_basename("20240115-120000", ""));
        assert!(is_valid_basename("nightly_20240115-120000", "nightly_"));
        assert!(!is_valid_basename("20240115120000", ""));
        assert!(!is_valid_basename("2024-01-15-120000", ""));
        assert!(!is_valid_basename("nightly_20240115-120000", ""));
        assert!(!is_valid_basename("20240115-12000x", ""));
        assert!(!is_valid_basename("", ""));
    }

    #[test]
    fn filter_keeps_only_matching_prefix() {
        let names = vec![
            "20240115-120000".to_string(),
            "other_20240115-120100".to_string(),
            "not-a-snapshot".to_string(),
            "20240115-120200".to_string(),
        ];

        let filtered = filter_basenames(names, "");
        assert_eq!(
            filtered,
            BTreeSet::from([
                "20240115-120000".to_string(),
                "20240115-120200".to_string()
            ])
        );
    }

    #[test]
    fn parent_for_picks_greatest_strictly_smaller() {
        let common = BTreeSet::from([
            "20240115-120000".to_string(),
            "20240115-120100".to_string(),
            "20240116-000000".to_string(),
        ]);

        assert_eq!(
            parent_for(&common, "20240115-120200"),
            Some("20240115-120100".to_string())
        );
        assert_eq!(parent_for(&common, "20240115-120000"), None);
        assert_eq!(parent_for(&common, "00000000-000000"), None);
        assert_eq!(
            parent_for(&common, "99999999-999999"),
            Some("20240116-000000".to_string())
        );
    }

    #[test]
    fn parent_for_empty_common_is_none() {
        assert_eq!(parent_for(&BTreeSet::new(), "20240115-120000"), None);
    }
}
