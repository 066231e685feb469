//! Dotted numeric versions (`1`, `1.2`, `1.2.3`, `1.2.3.4`)
//!
//! Missing components compare as 0, so `2` == `2.0.0`. A leading `v`, a
//! `-prerelease` and a `+build` suffix are ignored.

use std::fmt;
use std::str::FromStr;

const MAX_PARTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    parts: [u64; MAX_PARTS],
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version {input:?}: {reason}")]
pub struct VersionError {
    pub input: String,
    pub reason: &'static str,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            parts: [major, minor, patch, 0],
        }
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = |reason| VersionError {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core = trimmed
            .split(|c| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        if core.is_empty() {
            return Err(err("empty"));
        }

        let mut parts = [0u64; MAX_PARTS];
        let mut count = 0;
        for piece in core.split('.') {
            if count == MAX_PARTS {
                return Err(err("too many components"));
            }
            if piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err("components must be numeric"));
            }
            parts[count] = piece.parse().map_err(|_| err("component out of range"))?;
            count += 1;
        }

        Ok(Self { parts })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.parts;
        if d == 0 {
            write!(f, "{}.{}.{}", a, b, c)
        } else {
            write!(f, "{}.{}.{}.{}", a, b, c, d)
        }
    }
}
