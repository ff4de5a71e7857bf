//! Namespace name validation
//!
//! Valid names are 1 to 255 bytes of `[A-Za-z0-9_]` and not a reserved word.
//! Every byte is inspected and every reserved word compared on every call, so
//! the time taken does not depend on where a name goes wrong.

use meshvault_core::{MeshVaultError, Result};
use subtle::{Choice, ConstantTimeEq, ConstantTimeGreater, ConstantTimeLess};

/// Longest accepted namespace name in bytes
pub const MAX_NAMESPACE_LEN: usize = 255;

/// Names that can never be used as namespaces (compared case-insensitively)
pub const RESERVED_NAMESPACES: [&str; 5] = ["system", "admin", "root", "public", "private"];

#[inline]
fn in_range(b: u8, lo: u8, hi: u8) -> Choice {
    !b.ct_lt(&lo) & !b.ct_gt(&hi)
}

#[inline]
fn allowed_byte(b: u8) -> Choice {
    in_range(b, b'a', b'z') | in_range(b, b'A', b'Z') | in_range(b, b'0', b'9') | b.ct_eq(&b'_')
}

/// Case-insensitive match against an all-lowercase ASCII word
fn matches_word(name: &[u8], word: &[u8]) -> Choice {
    let mut equal = (name.len() as u64).ct_eq(&(word.len() as u64));
    for (i, &w) in word.iter().enumerate() {
        let b = name.get(i).copied().unwrap_or(0);
        // Setting bit 5 folds ASCII upper case onto lower case
        equal &= (b | 0x20).ct_eq(&w);
    }
    equal
}

/// Whether `name` is a valid namespace, without branching on its content
pub fn is_valid_namespace(name: &str) -> bool {
    let bytes = name.as_bytes();

    let len_ok = !(bytes.len() as u64).ct_eq(&0)
        & !(bytes.len() as u64).ct_gt(&(MAX_NAMESPACE_LEN as u64));

    let mut charset_ok = Choice::from(1u8);
    for &b in bytes {
        charset_ok &= allowed_byte(b);
    }

    let mut reserved = Choice::from(0u8);
    for word in RESERVED_NAMESPACES {
        reserved |= matches_word(bytes, word.as_bytes());
    }

    bool::from(len_ok & charset_ok & !reserved)
}

/// Validate a namespace name, explaining the first problem found on failure
pub fn validate_namespace(name: &str) -> Result<()> {
    if is_valid_namespace(name) {
        return Ok(());
    }

    // Only the failure path explains itself
    let reason = if name.is_empty() {
        "must not be empty".to_string()
    } else if name.len() > MAX_NAMESPACE_LEN {
        format!("longer than {MAX_NAMESPACE_LEN} bytes")
    } else if RESERVED_NAMESPACES
        .iter()
        .any(|w| name.eq_ignore_ascii_case(w))
    {
        "is reserved".to_string()
    } else {
        "may only contain [A-Za-z0-9_]".to_string()
    };

    Err(MeshVaultError::Namespace(format!(
        "invalid namespace {:?}: {reason}",
        truncate_for_display(name)
    )))
}

fn truncate_for_display(name: &str) -> String {
    name.chars().take(32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_names() {
        let longest = "x".repeat(MAX_NAMESPACE_LEN);
        for name in ["a", "alice", "Team_42", "_", "systems", "root_", longest.as_str()] {
            assert!(validate_namespace(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_rejects_bad_charset_and_length() {
        let too_long = "x".repeat(MAX_NAMESPACE_LEN + 1);
        for name in ["", "has space", "dash-name", "dot.name", "ünïcode", "semi;colon", too_long.as_str()] {
            assert!(
                matches!(validate_namespace(name), Err(MeshVaultError::Namespace(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_reserved_case_insensitive() {
        for name in ["system", "ADMIN", "Root", "pUbLiC", "private"] {
            let err = validate_namespace(name).unwrap_err();
            assert!(err.to_string().contains("reserved"));
        }
    }

    #[test]
    fn test_case_folding_does_not_admit_symbols() {
        // '@' | 0x20 == '`' and must not match any letter
        assert!(!is_valid_namespace("@dmin"));
        assert!(is_valid_namespace("Admin_"));
    }
}
