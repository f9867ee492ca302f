// src/config.rs
//! Mirror configuration
//!
//! Configuration can come from a TOML file:
//!
//! ```toml
//! source = "http://archive.ubuntu.com/ubuntu"
//! cache-path = "/srv/mirror/ubuntu"
//! check-mode = "size"
//! bandwidth-limit = 50.0
//! distributions = ["focal", "focal-updates"]
//! architectures = ["amd64"]
//! ```
//!
//! or be assembled in code / from command-line flags.

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How local files are compared against published metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CheckMode {
    /// Skip a distribution whose cached Release has the same date; files by size
    #[default]
    ReleaseDate,
    /// Compare lengths only
    Size,
    Md5,
    Sha1,
    Sha256,
}

impl CheckMode {
    /// Digest requested by this mode, if it is a digest mode
    pub fn algorithm(&self) -> Option<HashAlgorithm> {
        match self {
            CheckMode::ReleaseDate | CheckMode::Size => None,
            CheckMode::Md5 => Some(HashAlgorithm::Md5),
            CheckMode::Sha1 => Some(HashAlgorithm::Sha1),
            CheckMode::Sha256 => Some(HashAlgorithm::Sha256),
        }
    }
}

impl std::fmt::Display for CheckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckMode::ReleaseDate => write!(f, "release-date"),
            CheckMode::Size => write!(f, "size"),
            CheckMode::Md5 => write!(f, "md5"),
            CheckMode::Sha1 => write!(f, "sha1"),
            CheckMode::Sha256 => write!(f, "sha256"),
        }
    }
}

impl FromStr for CheckMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "release-date" | "releasedate" => Ok(CheckMode::ReleaseDate),
            "size" => Ok(CheckMode::Size),
            "md5" => Ok(CheckMode::Md5),
            "sha1" => Ok(CheckMode::Sha1),
            "sha256" => Ok(CheckMode::Sha256),
            _ => Err(Error::ConfigError(format!(
                "Unknown check mode {s:?} (expected release-date, size, md5, sha1 or sha256)"
            ))),
        }
    }
}

/// Settings for one mirroring run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorConfig {
    /// Repository root: `http(s)://` URL, `file://` URL or local path
    pub source: String,

    /// Local mirror tree
    pub cache_path: PathBuf,

    #[serde(default)]
    pub check_mode: CheckMode,

    /// Aggregate download ceiling in Mbit/s; 0 means unlimited
    #[serde(default)]
    pub bandwidth_limit: f64,

    /// Distributions to mirror, in order
    pub distributions: Vec<String>,

    /// Architectures to mirror; defaults to every one the Release lists
    #[serde(default)]
    pub architectures: Option<Vec<String>>,

    /// Concurrent transfers; defaults to the CPU count
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl MirrorConfig {
    pub fn new(source: impl Into<String>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            cache_path: cache_path.into(),
            check_mode: CheckMode::default(),
            bandwidth_limit: 0.0,
            distributions: Vec::new(),
            architectures: None,
            concurrency: None,
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))
    }

    /// Read a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::ConfigError("source must not be empty".to_string()));
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(Error::ConfigError("cache-path must not be empty".to_string()));
        }
        if self.distributions.is_empty() {
            return Err(Error::ConfigError(
                "at least one distribution is required".to_string(),
            ));
        }
        if let Some(dist) = self
            .distributions
            .iter()
            .find(|d| d.is_empty() || d.contains("..") || d.starts_with('/'))
        {
            return Err(Error::ConfigError(format!("invalid distribution name {dist:?}")));
        }
        if let Some(arches) = &self.architectures
            && arches.iter().any(|a| a.trim().is_empty())
        {
            return Err(Error::ConfigError("empty architecture name".to_string()));
        }
        if !self.bandwidth_limit.is_finite() || self.bandwidth_limit < 0.0 {
            return Err(Error::ConfigError(format!(
                "bandwidth-limit must be a non-negative number, got {}",
                self.bandwidth_limit
            )));
        }
        if self.concurrency == Some(0) {
            return Err(Error::ConfigError("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Number of concurrent transfers
    pub fn concurrency_width(&self) -> usize {
        self.concurrency.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let config = MirrorConfig::from_toml_str(
            r#"
source = "http://deb.debian.org/debian"
cache-path = "/srv/mirror"
check-mode = "release-date"
bandwidth-limit = 8.0
distributions = ["bookworm"]
architectures = ["amd64", "arm64"]
concurrency = 4
"#,
        )
        .unwrap();

        assert_eq!(config.check_mode, CheckMode::ReleaseDate);
        assert_eq!(config.distributions, vec!["bookworm"]);
        assert_eq!(config.concurrency_width(), 4);
        assert_eq!(config.bandwidth_limit, 8.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = MirrorConfig::from_toml_str(
            "source = \"/srv/up\"\ncache-path = \"/srv/down\"\ndistributions = [\"stable\"]\n",
        )
        .unwrap();

        assert_eq!(config.check_mode, CheckMode::ReleaseDate);
        assert_eq!(config.bandwidth_limit, 0.0);
        assert!(config.architectures.is_none());
        assert!(config.concurrency_width() >= 1);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = MirrorConfig::new("http://x", "/tmp/m");
        assert!(config.validate().is_err());
        assert_eq!(config.check_mode, CheckMode::ReleaseDate);

        config.distributions = vec!["../etc".to_string()];
        assert!(config.validate().is_err());

        config.distributions = vec!["stable".to_string()];
        config.validate().unwrap();

        config.bandwidth_limit = -1.0;
        assert!(config.validate().is_err());
        config.bandwidth_limit = 0.0;

        config.concurrency = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_check_mode_parse() {
        assert_eq!("Release-Date".parse::<CheckMode>().unwrap(), CheckMode::ReleaseDate);
        assert_eq!("sha256".parse::<CheckMode>().unwrap(), CheckMode::Sha256);
        assert!("crc32".parse::<CheckMode>().is_err());
        assert_eq!(CheckMode::Md5.algorithm(), Some(HashAlgorithm::Md5));
        assert_eq!(CheckMode::Size.to_string(), "size");
    }
}
