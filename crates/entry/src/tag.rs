//! Tag name validation
//!
//! Tag names travel through negotiation RPCs and end up in on-disk tag
//! lists, so the accepted character set is narrow: ASCII alphanumerics,
//! dash, and underscore.

use thiserror::Error;

/// Maximum accepted tag name length in bytes
pub const MAX_TAG_LENGTH: usize = 4096;

/// Errors from tag name validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    /// Tag name is empty
    #[error("tag name is empty")]
    Empty,

    /// Tag name exceeds the maximum length
    #[error("tag name too long: {len} bytes exceeds maximum {max} bytes")]
    TooLong { len: usize, max: usize },

    /// Tag name contains a character outside the accepted set
    #[error("tag name contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
}

/// Validate a tag name
///
/// # Errors
///
/// Returns an error if the name is empty, too long, or contains characters
/// outside `[A-Za-z0-9_-]`.
pub fn check_tag(name: &str) -> Result<(), TagError> {
    if name.is_empty() {
        return Err(TagError::Empty);
    }
    if name.len() > MAX_TAG_LENGTH {
        return Err(TagError::TooLong {
            len: name.len(),
            max: MAX_TAG_LENGTH,
        });
    }
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(TagError::ForbiddenCharacter(c));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_tag_valid() {
        check_tag("default").unwrap();
        check_tag("syslog-firewall").unwrap();
        check_tag("win_events_2").unwrap();
        check_tag("A").unwrap();
    }

    #[test]
    fn test_check_tag_empty() {
        assert_eq!(check_tag(""), Err(TagError::Empty));
    }

    #[test]
    fn test_check_tag_too_long() {
        let name = "x".repeat(MAX_TAG_LENGTH + 1);
        assert_eq!(
            check_tag(&name),
            Err(TagError::TooLong {
                len: MAX_TAG_LENGTH + 1,
                max: MAX_TAG_LENGTH,
            })
        );
    }

    #[test]
    fn test_check_tag_forbidden_characters() {
        for bad in ["sys log", "a$b", "tag!", "semi;colon", "dotted.tag", "日誌"] {
            assert!(
                matches!(check_tag(bad), Err(TagError::ForbiddenCharacter(_))),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn test_check_tag_max_length_accepted() {
        let name = "x".repeat(MAX_TAG_LENGTH);
        check_tag(&name).unwrap();
    }
}
