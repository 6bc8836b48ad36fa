//! MIMO release version comparison
//!
//! Release strings look like `V2.3` or `v2.3.1`. Only major and minor take
//! part in ordering; unparsable components count as zero.

use std::cmp::Ordering;
use std::fmt;

/// Major/minor pair of a MIMO release
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MimoVersion {
    pub major: u32,
    pub minor: u32,
}

impl MimoVersion {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let bare = trimmed
            .strip_prefix('V')
            .or_else(|| trimmed.strip_prefix('v'))
            .unwrap_or(trimmed);

        let mut parts = bare.split('.').map(|p| p.trim().parse::<u32>().unwrap_or(0));
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
        }
    }
}

impl fmt::Display for MimoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}.{}", self.major, self.minor)
    }
}

/// Order two release strings by major, then minor
pub fn compare(installed: &str, candidate: &str) -> Ordering {
    MimoVersion::parse(installed).cmp(&MimoVersion::parse(candidate))
}

/// True when `a` is an older release than `b`
pub fn version_less(a: &str, b: &str) -> bool {
    compare(a, b) == Ordering::Less
}
