use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};


/// A client protocol version `major.minor.patch`. It is sent as a single u32 'version code'
///  `major*10000 + minor*100 + patch`, which restricts the components' ranges.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const MAX_MAJOR: u32 = 9999;
    pub const MAX_MINOR: u32 = 99;
    pub const MAX_PATCH: u32 = 99;

    pub fn new(major: u32, minor: u32, patch: u32) -> anyhow::Result<ProtocolVersion> {
        if major > Self::MAX_MAJOR || minor > Self::MAX_MINOR || patch > Self::MAX_PATCH {
            bail!("version {}.{}.{} can not be represented as a version code: bounds are {}.{}.{}",
                major, minor, patch, Self::MAX_MAJOR, Self::MAX_MINOR, Self::MAX_PATCH);
        }
        Ok(ProtocolVersion { major, minor, patch })
    }

    pub fn version_code(&self) -> u32 {
        self.major * 10_000 + self.minor * 100 + self.patch
    }
}

impl FromStr for ProtocolVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');

        let mut next_component = |name: &str| -> anyhow::Result<u32> {
            let raw = parts.next()
                .ok_or_else(|| anyhow!("version {:?} has no {} component", s, name))?;
            raw.trim().parse::<u32>()
                .map_err(|e| anyhow!("version {:?} has an invalid {} component {:?}: {}", s, name, raw, e))
        };

        let major = next_component("major")?;
        let minor = next_component("minor")?;
        let patch = next_component("patch")?;

        if parts.next().is_some() {
            bail!("version {:?} has more than three components", s);
        }

        ProtocolVersion::new(major, minor, patch)
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
