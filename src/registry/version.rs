// Copyright 2024-2026 Fluxserve Contributors
// SPDX-License-Identifier: Apache-2.0

//! Semantic versioning for model versions.
//!
//! The registry orders versions by semver; configs carry the string form.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Invalid version component: {0}")]
    InvalidComponent(String),
}

/// Semantic version with major.minor.patch and optional prerelease.
///
/// Short forms are accepted: "2" and "2.0" normalize to "2.0.0".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub prerelease: Option<String>,
}

impl ModelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
        }
    }

    /// Parse from string, e.g. "1.2.3", "1.0", or "2.0.0-beta".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let (version_part, prerelease) = match s.find('-') {
            Some(idx) => (&s[..idx], Some(s[idx + 1..].to_string())),
            None => (s, None),
        };

        let parts: Vec<&str> = version_part.split('.').collect();
        if parts.is_empty() || parts.len() > 3 || parts[0].is_empty() {
            return Err(VersionError::InvalidFormat(s.to_string()));
        }

        let parse_part = |p: &str| -> Result<u32, VersionError> {
            p.parse()
                .map_err(|_| VersionError::InvalidComponent(p.to_string()))
        };

        Ok(Self {
            major: parse_part(parts[0])?,
            minor: parts.get(1).map(|p| parse_part(p)).transpose()?.unwrap_or(0),
            patch: parts.get(2).map(|p| parse_part(p)).transpose()?.unwrap_or(0),
            prerelease,
        })
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl FromStr for ModelVersion {
    type Err = VersionError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ModelVersion> for String {
    fn from(v: ModelVersion) -> Self {
        v.to_string()
    }
}

impl TryFrom<String> for ModelVersion {
    type Error = VersionError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl Ord for ModelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // Prerelease versions sort below the release.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for ModelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
