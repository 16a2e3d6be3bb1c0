//! Utility functions for stockgroup

use serde::{Deserialize, Serialize};

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let split = if s.ends_with("ms") {
        s.len() - 2
    } else {
        s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0)
    };
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Lifecycle of a member process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Waiting for a view and the initial state
    Joining,
    /// In the view with state installed
    Serving,
    /// Cannot see a majority of the view
    Isolated,
    /// A view was installed that does not contain this member
    Excluded,
    /// Left the group
    Left,
}

impl MemberStatus {
    /// Can this member issue replicated mutations?
    pub fn can_write(&self) -> bool {
        matches!(self, MemberStatus::Serving)
    }

    /// Is the local copy meaningful to read?
    pub fn can_read(&self) -> bool {
        matches!(self, MemberStatus::Serving | MemberStatus::Isolated)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Joining => write!(f, "joining"),
            MemberStatus::Serving => write!(f, "serving"),
            MemberStatus::Isolated => write!(f, "isolated"),
            MemberStatus::Excluded => write!(f, "excluded"),
            MemberStatus::Left => write!(f, "left"),
        }
    }
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate a ticker symbol (non-empty, reasonable length, printable)
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidKey("key cannot be empty".into()));
    }

    if key.len() > 256 {
        return Err(crate::Error::InvalidKey("key too long (max 256 bytes)".into()));
    }

    if key.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidKey(
            "key contains invalid characters".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("500ms").unwrap(),
            std::time::Duration::from_millis(500)
        );
        assert_eq!(
            parse_duration("30s").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("5m").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert_eq!(
            parse_duration("1h").unwrap(),
            std::time::Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_member_status() {
        assert!(MemberStatus::Serving.can_write());
        assert!(MemberStatus::Serving.can_read());

        assert!(!MemberStatus::Isolated.can_write());
        assert!(MemberStatus::Isolated.can_read());

        assert!(!MemberStatus::Joining.can_read());
        assert!(!MemberStatus::Left.can_write());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("AAPL").is_ok());
        assert!(validate_key("BRK.B").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"x".repeat(300)).is_err());
        assert!(validate_key("AA\nPL").is_err());
    }
}
