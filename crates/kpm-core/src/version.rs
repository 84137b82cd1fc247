//! Version ordering.
//!
//! Package versions are usually semantic versions (optionally `v`-prefixed,
//! as git tags often are), but commits and free-form tags also show up. The
//! order used everywhere in resolution:
//! - the empty string and `"none"` sort below every concrete version,
//! - two semantic versions compare by semver precedence,
//! - anything else compares lexically.

use std::cmp::Ordering;

/// The bottom version: "no version selected".
pub const NONE: &str = "none";

/// Parse a version string like "1.2.3" or "v1.2.3".
fn parse_version(s: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(s.strip_prefix('v').unwrap_or(s))
}

/// Whether `v` is the bottom version.
pub fn is_none(v: &str) -> bool {
    v.is_empty() || v == NONE
}

/// Total order over version strings with the bottom version as minimum.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (is_none(a), is_none(b)) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    match (parse_version(a), parse_version(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// The greater of two versions.
pub fn max<'a>(a: &'a str, b: &'a str) -> &'a str {
    if compare(a, b) == Ordering::Less {
        b
    } else {
        a
    }
}

/// Greatest version in a list, if any is concrete.
pub fn latest<'a, I>(versions: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    versions
        .into_iter()
        .filter(|v| !is_none(v))
        .max_by(|a, b| compare(a, b))
}

/// Greatest version strictly below `current`, if any.
pub fn previous<'a, I>(versions: I, current: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    versions
        .into_iter()
        .filter(|v| !is_none(v) && compare(v, current) == Ordering::Less)
        .max_by(|a, b| compare(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_bottom() {
        assert_eq!(max("", "1.0.0"), "1.0.0");
        assert_eq!(max("1.0.0", ""), "1.0.0");
        assert_eq!(max(NONE, "0.0.1"), "0.0.1");
        assert_eq!(compare("", NONE), Ordering::Equal);
    }

    #[test]
    fn semver_precedence_not_lexical() {
        assert_eq!(max("0.1.10", "0.1.9"), "0.1.10");
        assert_eq!(max("1.0.0-alpha", "1.0.0"), "1.0.0");
        assert_eq!(max("v1.2.0", "1.10.0"), "1.10.0");
    }

    #[test]
    fn opaque_versions_compare_lexically() {
        assert_eq!(max("ade147b", "0f1e2d3"), "ade147b");
        assert_eq!(max("main", ""), "main");
    }

    #[test]
    fn compare_is_antisymmetric() {
        let vs = ["", "none", "0.1.0", "v0.1.0", "0.2.0", "abc", "1.0.0-rc.1"];
        for a in vs {
            for b in vs {
                assert_eq!(compare(a, b), compare(b, a).reverse(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn latest_and_previous() {
        let tags = ["0.1.0", "0.1.2", "0.1.1", "latest-dev"];
        assert_eq!(latest(tags), Some("latest-dev"));
        let semver_tags = ["0.1.0", "0.1.2", "0.1.1"];
        assert_eq!(latest(semver_tags), Some("0.1.2"));
        assert_eq!(previous(semver_tags, "0.1.2"), Some("0.1.1"));
        assert_eq!(previous(semver_tags, "0.1.0"), None);
        assert_eq!(latest(std::iter::empty::<&str>()), None);
    }
}
