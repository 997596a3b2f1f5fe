//! Dotted version comparison

use std::cmp::Ordering;

fn components(version: &str) -> Vec<u64> {
    let version = version.trim().trim_start_matches('v');
    // "1.2.3-beta.1" and "1.2.3+build" compare as "1.2.3"
    let core = version.split(['-', '+']).next().unwrap_or_default();
    core.split('.')
        .map(|part| part.parse::<u64>().unwrap_or(0))
        .collect()
}

/// Compare two dotted numeric versions. Missing components count as zero.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = components(a);
    let b = components(b);
    let len = a.len().max(b.len());

    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `running` is strictly older than `required`
pub fn is_older(running: &str, required: &str) -> bool {
    compare(running, required) == Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_older() {
        assert!(is_older("0.1.0", "0.2.0"));
        assert!(is_older("1.9.9", "1.10.0"));
        assert!(!is_older("1.10.0", "1.9.9"));
        assert!(!is_older("1.2.3", "1.2.3"));
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Equal);
        assert!(is_older("1", "1.0.1"));
    }

    #[test]
    fn test_prerelease_suffix_ignored() {
        assert_eq!(compare("1.2.3-beta.1", "1.2.3"), Ordering::Equal);
        assert_eq!(compare("v2.0.0", "2.0.0"), Ordering::Equal);
    }
}
