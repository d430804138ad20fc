//! Cluster version as reported by discovery.

use std::fmt;

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse discovery's `major`/`minor` strings. Providers often append
    /// a `+` or other suffix to the minor version, which is ignored.
    pub fn parse(major: &str, minor: &str) -> Result<Self, CoreError> {
        let digits = |s: &str| -> Result<u32, CoreError> {
            let d: String = s.trim().chars().take_while(char::is_ascii_digit).collect();
            d.parse().map_err(|_| CoreError::InvalidVersion(format!("{}.{}", major, minor)))
        };
        Ok(Self { major: digits(major)?, minor: digits(minor)? })
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= Self::new(major, minor)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
