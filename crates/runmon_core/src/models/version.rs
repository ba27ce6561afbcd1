//! Pipeline version parsing and comparison.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `major.minor` pipeline version as published by the first stage.
///
/// Only the first two numeric components take part in comparisons;
/// the original text is kept for building storage paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PipelineVersion {
    major: u32,
    minor: u32,
    raw: String,
}

impl PipelineVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            raw: format!("{}.{}", major, minor),
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// The version exactly as published, used as a path component.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// True when `v0 >= v1`.
///
/// An absent threshold is always satisfied; an absent version never is.
pub fn after(v0: Option<&PipelineVersion>, v1: Option<&PipelineVersion>) -> bool {
    match (v0, v1) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(v0), Some(v1)) => v0 >= v1,
    }
}

impl FromStr for PipelineVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err("empty pipeline version".to_string());
        }
        let mut parts = raw.split('.');
        let parse = |part: Option<&str>| -> Result<u32, String> {
            match part {
                None | Some("") => Ok(0),
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|_| format!("invalid pipeline version '{}'", raw)),
            }
        };
        let major = parse(parts.next())?;
        let minor = parse(parts.next())?;
        Ok(Self {
            major,
            minor,
            raw: raw.to_string(),
        })
    }
}

impl TryFrom<String> for PipelineVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PipelineVersion> for String {
    fn from(version: PipelineVersion) -> Self {
        version.raw
    }
}

impl fmt::Display for PipelineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for PipelineVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PipelineVersion {}

impl PartialOrd for PipelineVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PipelineVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PipelineVersion {
        s.parse().unwrap()
    }

    #[test]
    fn parses_major_minor() {
        let version = v("3.12");
        assert_eq!(version.major(), 3);
        assert_eq!(version.minor(), 12);
        assert_eq!(version.as_str(), "3.12");
    }

    #[test]
    fn missing_minor_is_zero() {
        assert_eq!(v("2"), PipelineVersion::new(2, 0));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<PipelineVersion>().is_err());
        assert!("abc".parse::<PipelineVersion>().is_err());
    }

    #[test]
    fn compares_numerically_not_lexically() {
        assert!(v("3.10") > v("3.2"));
        assert!(v("1.5") < v("2.0"));
    }

    #[test]
    fn after_handles_absent_sides() {
        let threshold = v("1.5");
        assert!(after(Some(&v("1.5")), Some(&threshold)));
        assert!(!after(Some(&v("1.4")), Some(&threshold)));
        assert!(!after(None, Some(&threshold)));
        assert!(after(None, None));
    }
}
