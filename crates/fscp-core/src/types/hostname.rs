//! Hostnames.

use super::InvalidArgument;
use std::fmt;
use std::str::FromStr;

/// A DNS hostname: dot-separated labels of at most 63 characters, each
/// alphanumeric with interior hyphens, 255 characters total.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hostname(String);

impl Hostname {
    /// The hostname string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn label_is_valid(label: &str) -> bool {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
}

impl FromStr for Hostname {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 255 {
            return Err(InvalidArgument::new("Hostname", s));
        }
        if !s.split('.').all(Self::label_is_valid) {
            return Err(InvalidArgument::new("Hostname", s));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
