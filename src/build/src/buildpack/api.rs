//! Buildpack and platform API versions.
//!
//! API versions are two-part (`major.minor`), unlike lifecycle release
//! versions which are full semver. `0.2` and `0.10` are distinct APIs;
//! a missing minor defaults to zero.

use std::fmt;
use std::str::FromStr;

use kiln_core::error::KilnError;
use serde::{Deserialize, Serialize};

/// A buildpack or platform API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ApiVersion {
    pub major: u64,
    pub minor: u64,
}

impl ApiVersion {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

impl FromStr for ApiVersion {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KilnError::Config(format!("invalid API version '{}'", s));

        let mut parts = s.trim().splitn(2, '.');
        let major = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(invalid)?
            .parse::<u64>()
            .map_err(|_| invalid())?;
        let minor = match parts.next() {
            Some(minor) => minor.parse::<u64>().map_err(|_| invalid())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for ApiVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApiVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
