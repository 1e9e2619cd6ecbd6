/*!
Migration version identifiers.
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TidemarkError;

/// Semantic version of a migration step, e.g. `v5.0.0-1`
///
/// Ordered by `major.minor.patch`, then by the optional numeric sequence
/// suffix; a bare version sorts before any suffixed one of the same release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub sequence: Option<u32>,
}

impl MigrationVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            sequence: None,
        }
    }

    pub const fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(sequence) = self.sequence {
            write!(f, "-{sequence}")?;
        }
        Ok(())
    }
}

impl FromStr for MigrationVersion {
    type Err = TidemarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TidemarkError::validation(format!("Invalid migration version: {s:?}"));
        let number = |part: &str| -> Result<u32, TidemarkError> {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let trimmed = s.strip_prefix('v').unwrap_or(s);
        let (release, sequence) = match trimmed.split_once('-') {
            Some((release, sequence)) => (release, Some(number(sequence)?)),
            None => (trimmed, None),
        };

        let mut parts = release.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            major: number(major)?,
            minor: number(minor)?,
            patch: number(patch)?,
            sequence,
        })
    }
}

impl TryFrom<String> for MigrationVersion {
    type Error = TidemarkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MigrationVersion> for String {
    fn from(version: MigrationVersion) -> Self {
        version.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> MigrationVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let version = v("v5.0.0-1");
        assert_eq!(version, MigrationVersion::new(5, 0, 0).with_sequence(1));
        assert_eq!(version.to_string(), "v5.0.0-1");
        assert_eq!(v("3.2.1").to_string(), "v3.2.1");
    }

    #[test]
    fn test_ordering() {
        let mut versions = vec![v("v5.0.0-2"), v("v4.10.0"), v("v5.0.0"), v("v4.9.3"), v("v5.0.0-1")];
        versions.sort();
        let rendered: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["v4.9.3", "v4.10.0", "v5.0.0", "v5.0.0-1", "v5.0.0-2"]
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "v", "v5", "v5.0", "v5.0.0.0", "v5.0.0-", "v5.0.0-a", "v5.x.0", "v-1.0.0"] {
            assert!(bad.parse::<MigrationVersion>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("v5.0.0-1")).unwrap();
        assert_eq!(json, "\"v5.0.0-1\"");
        let back: MigrationVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("v5.0.0-1"));
        assert!(serde_json::from_str::<MigrationVersion>("\"nope\"").is_err());
    }
}
