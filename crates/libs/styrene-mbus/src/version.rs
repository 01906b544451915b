use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// A `major.minor.micro` protocol version.
///
/// Ordering is lexicographic over the three components, which is what codec
/// selection and the minimum-over-recipients rule rely on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self { major, minor, micro }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl FromStr for Version {
    type Err = BusError;

    /// Accepts one to three numeric components; missing ones default to zero.
    /// Anything after a fourth `.` (a build qualifier) is ignored.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BusError::InvalidVersion(raw.to_owned()));
        }
        let mut parts = [0u32; 3];
        for (index, component) in raw.splitn(4, '.').take(3).enumerate() {
            parts[index] =
                component.parse().map_err(|_| BusError::InvalidVersion(raw.to_owned()))?;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}
