//! Target platform identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A normalized `os/arch[/variant]` platform string, e.g. `linux/amd64`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform(String);

impl Platform {
    /// Parses and normalizes a platform string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string does not have two or three non-empty
    /// `/`-separated components.
    pub fn new(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let parts: Vec<&str> = normalized.split('/').collect();
        if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::Config(format!(
                "Invalid platform '{}'. Expected os/arch or os/arch/variant",
                value
            )));
        }
        Ok(Self(normalized))
    }

    /// Returns the platform of the running host.
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "arm" => "arm",
            "powerpc64" => "ppc64le",
            "s390x" => "s390x",
            "riscv64" => "riscv64",
            other => other,
        };
        Self(format!("{}/{}", std::env::consts::OS, arch))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the operating system component.
    pub fn os(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    /// Returns the architecture component.
    pub fn architecture(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }

    /// Returns the form used inside remote keys: path separators become dashes.
    pub fn suffix(&self) -> String {
        self.0.replace('/', "-")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Platform {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Platform> for String {
    fn from(platform: Platform) -> Self {
        platform.0
    }
}
