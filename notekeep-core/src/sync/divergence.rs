//! Divergence classification between a local and a remote copy.
//!
//! The append-only heuristic lives here as a plain function, away from the
//! engine, so its edge cases (empty strings, whitespace-only differences)
//! stay unit-testable in isolation.

use chrono::{DateTime, Utc};

/// How a local and a remote copy of the same note relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Equal after trimming; only whitespace may differ.
    Identical,
    /// Remote starts with local and is strictly longer - another device
    /// kept typing. Safe to adopt remote without asking.
    RemoteExtendsLocal,
    /// Local starts with remote and is strictly longer - this device kept
    /// typing. Safe to push local without asking.
    LocalExtendsRemote,
    /// Neither side is a prefix of the other.
    Conflict,
}

/// Classifies the relationship between trimmed local and remote content.
pub fn classify(local: &str, remote: &str) -> Divergence {
    let local = local.trim();
    let remote = remote.trim();
    if local == remote {
        return Divergence::Identical;
    }
    // not equal, so a prefix match implies strictly longer
    if remote.starts_with(local) {
        return Divergence::RemoteExtendsLocal;
    }
    if local.starts_with(remote) {
        return Divergence::LocalExtendsRemote;
    }
    Divergence::Conflict
}

/// Naive merge: local content, a timestamped separator line, then remote
/// content. No diff algorithm; both sides survive verbatim.
pub fn merge_contents(local: &str, remote: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}\n\n----- merged {} -----\n\n{}",
        local.trim_end(),
        at.format("%Y-%m-%d %H:%M:%S UTC"),
        remote.trim_start()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_is_identical() {
        assert_eq!(classify("hello", "hello"), Divergence::Identical);
    }

    #[test]
    fn test_whitespace_only_difference_is_identical() {
        assert_eq!(classify("  hello\n", "hello"), Divergence::Identical);
        assert_eq!(classify("\t\n", "   "), Divergence::Identical);
    }

    #[test]
    fn test_both_empty_is_identical() {
        assert_eq!(classify("", ""), Divergence::Identical);
    }

    #[test]
    fn test_remote_extends_local() {
        assert_eq!(
            classify("hello", "hello world"),
            Divergence::RemoteExtendsLocal
        );
    }

    #[test]
    fn test_empty_local_nonempty_remote_is_remote_extension() {
        assert_eq!(classify("", "anything"), Divergence::RemoteExtendsLocal);
    }

    #[test]
    fn test_local_extends_remote() {
        assert_eq!(
            classify("hello world", "hello"),
            Divergence::LocalExtendsRemote
        );
        assert_eq!(classify("anything", ""), Divergence::LocalExtendsRemote);
    }

    #[test]
    fn test_disjoint_content_is_conflict() {
        assert_eq!(classify("A", "B"), Divergence::Conflict);
    }

    #[test]
    fn test_shared_prefix_but_divergent_is_conflict() {
        assert_eq!(
            classify("hello there", "hello world"),
            Divergence::Conflict
        );
    }

    #[test]
    fn test_trimming_applies_before_prefix_check() {
        // leading whitespace must not defeat the prefix match
        assert_eq!(
            classify("  hello", "hello world  "),
            Divergence::RemoteExtendsLocal
        );
    }

    #[test]
    fn test_merge_contains_both_sides_and_separator() {
        let at = "2026-01-05T10:30:00Z".parse().unwrap();
        let merged = merge_contents("local text", "remote text", at);
        assert!(merged.contains("local text"));
        assert!(merged.contains("remote text"));
        assert!(merged.contains("----- merged 2026-01-05 10:30:00 UTC -----"));
        // local side comes first
        assert!(merged.find("local text").unwrap() < merged.find("remote text").unwrap());
    }

    #[test]
    fn test_merge_collapses_boundary_whitespace() {
        let at = Utc::now();
        let merged = merge_contents("local\n\n\n", "\n\nremote", at);
        assert!(merged.starts_with("local\n\n-----"));
        assert!(merged.ends_with("-----\n\nremote"));
    }
}
