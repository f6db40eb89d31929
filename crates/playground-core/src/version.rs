//! Loose semver-style comparison of database version tags.
//!
//! Tags look like `21.8.3`, `21.8.3-alpine`, `head` or `latest`, so the
//! comparison is component-wise: numeric where both sides parse, falling
//! back to lexicographic order otherwise.

/// Split a version tag into its components.
///
/// `parse("21.1.8-alpine")` is `["21", "1", "8", "alpine"]`.
pub fn parse(version: &str) -> Vec<String> {
    version
        .split(|c: char| c == '.' || c == '-' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether version `a` is strictly greater than version `b`.
pub fn is_greater(a: &[String], b: &[String]) -> bool {
    for (x, y) in a.iter().zip(b.iter()) {
        match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) if nx != ny => return nx > ny,
            (Ok(_), Ok(_)) => continue,
            _ if x != y => return x > y,
            _ => continue,
        }
    }

    a.len() > b.len()
}

/// Whether a database version is at least the given major version.
///
/// Rolling tags (`head*`, `latest*`) always qualify.
pub fn is_at_least_major(version: &str, major: &str) -> bool {
    if version.starts_with("head") || version.starts_with("latest") {
        return true;
    }

    !is_greater(&parse(major), &parse(version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_separators() {
        assert_eq!(parse("1.2.312"), vec!["1", "2", "312"]);
        assert_eq!(parse("10.0"), vec!["10", "0"]);
        assert_eq!(parse("20"), vec!["20"]);
        assert_eq!(parse("1.2.3-alpine"), vec!["1", "2", "3", "alpine"]);
        assert_eq!(parse("head"), vec!["head"]);
        assert_eq!(parse("latest"), vec!["latest"]);
    }

    #[test]
    fn at_least_major() {
        assert!(!is_at_least_major("1", "21"));
        assert!(!is_at_least_major("1", "21.1"));
        assert!(!is_at_least_major("1.28", "21"));
        assert!(!is_at_least_major("9.11", "10"));
        assert!(is_at_least_major("21.32", "20"));
        assert!(is_at_least_major("21", "21"));
    }

    #[test]
    fn rolling_tags_always_qualify() {
        assert!(is_at_least_major("head", "21"));
        assert!(is_at_least_major("head-alpine", "21"));
        assert!(is_at_least_major("latest", "99"));
    }

    #[test]
    fn numeric_comparison_is_not_lexicographic() {
        assert!(is_greater(&parse("21.10"), &parse("21.9")));
        assert!(!is_greater(&parse("21.9"), &parse("21.10")));
    }

    #[test]
    fn longer_version_wins_on_equal_prefix() {
        assert!(is_greater(&parse("21.8.1"), &parse("21.8")));
        assert!(!is_greater(&parse("21.8"), &parse("21.8.1")));
    }
}
