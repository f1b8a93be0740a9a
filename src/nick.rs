//! Nick validation and normalization.

use crate::{Error, Result};

/// Maximum nick length, in unicode scalar values.
pub const MAX_NICK_LENGTH: usize = 36;

const LTR_EMBED: char = '\u{202A}';
const RTL_EMBED: char = '\u{202B}';
const LTR_OVERRIDE: char = '\u{202D}';
const RTL_OVERRIDE: char = '\u{202E}';
const LTR_ISOLATE: char = '\u{2066}';
const RTL_ISOLATE: char = '\u{2067}';
const FS_ISOLATE: char = '\u{2068}';

const BIDI_EXPLICIT_POP: char = '\u{202C}';
const BIDI_ISOLATE_POP: char = '\u{2069}';

/// Validates and normalizes a proposed name from a user.
///
/// If the proposed name is not valid, returns an error. Otherwise, returns
/// the normalized form of the name. Normalization for a nick consists of:
///
/// 1. Remove leading and trailing whitespace.
/// 2. Collapse all internal whitespace runs to single ASCII spaces.
/// 3. Close any unbalanced unicode bidi control codes.
pub fn normalize_nick(name: &str) -> Result<String> {
    let normalized = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.is_empty() {
        return Err(Error::InvalidNick);
    }
    if normalized.chars().count() > MAX_NICK_LENGTH {
        return Err(Error::InvalidNick);
    }
    Ok(normalize_bidi(normalized))
}

/// Prevents names from using bidi control codes to screw up the layout of
/// everyone else's client.
///
/// Counts unmatched Explicit and Isolate openers and appends the matching
/// pop characters. Stray pop characters are tolerated in place and never
/// take an open counter below zero.
fn normalize_bidi(name: String) -> String {
    let mut explicit_depth = 0_usize;
    let mut isolate_depth = 0_usize;

    for c in name.chars() {
        match c {
            LTR_EMBED | RTL_EMBED | LTR_OVERRIDE | RTL_OVERRIDE => explicit_depth += 1,
            BIDI_EXPLICIT_POP => explicit_depth = explicit_depth.saturating_sub(1),
            LTR_ISOLATE | RTL_ISOLATE | FS_ISOLATE => isolate_depth += 1,
            BIDI_ISOLATE_POP => isolate_depth = isolate_depth.saturating_sub(1),
            _ => {}
        }
    }

    if explicit_depth + isolate_depth == 0 {
        return name;
    }

    let mut balanced = name;
    for _ in 0..explicit_depth {
        balanced.push(BIDI_EXPLICIT_POP);
    }
    for _ in 0..isolate_depth {
        balanced.push(BIDI_ISOLATE_POP);
    }
    balanced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_trimmed_and_collapsed() {
        assert_eq!(normalize_nick("  nanook  ").unwrap(), "nanook");
        assert_eq!(normalize_nick("max\t\n power").unwrap(), "max power");
    }

    #[test]
    fn empty_and_overlong_names_are_rejected() {
        assert!(matches!(normalize_nick(""), Err(Error::InvalidNick)));
        assert!(matches!(normalize_nick("   "), Err(Error::InvalidNick)));
        let long = "x".repeat(MAX_NICK_LENGTH + 1);
        assert!(matches!(normalize_nick(&long), Err(Error::InvalidNick)));
        let exactly = "x".repeat(MAX_NICK_LENGTH);
        assert_eq!(normalize_nick(&exactly).unwrap(), exactly);
    }

    #[test]
    fn unbalanced_bidi_openers_are_closed() {
        assert_eq!(normalize_nick("a\u{202E}b").unwrap(), "a\u{202E}b\u{202C}");
        assert_eq!(normalize_nick("a\u{2066}b").unwrap(), "a\u{2066}b\u{2069}");
        // Explicit pops come before isolate pops.
        assert_eq!(
            normalize_nick("\u{2066}\u{202A}x").unwrap(),
            "\u{2066}\u{202A}x\u{202C}\u{2069}"
        );
    }

    #[test]
    fn stray_pops_are_tolerated() {
        // A lone pop neither errors nor produces more pops.
        assert_eq!(normalize_nick("a\u{202C}b").unwrap(), "a\u{202C}b");
        // A pop of the wrong kind does not cancel an opener.
        assert_eq!(
            normalize_nick("a\u{202A}\u{2069}b").unwrap(),
            "a\u{202A}\u{2069}b\u{202C}"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for name in [
            "nanook",
            "  spaced   out  ",
            "a\u{202E}b",
            "\u{2066}\u{202A}x",
            "a\u{202C}b",
        ] {
            let once = normalize_nick(name).unwrap();
            let twice = normalize_nick(&once).unwrap();
            assert_eq!(once, twice, "normalize not idempotent for {name:?}");
        }
    }
}
