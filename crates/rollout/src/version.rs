//! Kubernetes version parsing and upgrade-path rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A `major.minor.patch` Kubernetes version (leading `v` accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KubeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KubeVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Number of minor versions `target` is ahead of `self` (negative when
    /// behind). Different majors never form a valid upgrade path.
    #[must_use]
    pub fn minor_distance(&self, target: &Self) -> Option<i64> {
        (self.major == target.major).then(|| i64::from(target.minor) - i64::from(self.minor))
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KubeVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        // kubelet reports e.g. "v1.29.2-gke.1" or "1.29.2+k3s1"
        let core = trimmed
            .split(|c| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |name: &str, required: bool| -> Result<u32, String> {
            match parts.next() {
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid {name} component in version '{s}'")),
                None if required => Err(format!("Missing {name} component in version '{s}'")),
                None => Ok(0),
            }
        };
        let major = next("major", true)?;
        let minor = next("minor", true)?;
        let patch = next("patch", false)?;
        if parts.next().is_some() {
            return Err(format!("Too many components in version '{s}'"));
        }
        Ok(Self::new(major, minor, patch))
    }
}

impl TryFrom<String> for KubeVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KubeVersion> for String {
    fn from(value: KubeVersion) -> Self {
        value.to_string()
    }
}

/// Why a requested upgrade path is not allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradePathError {
    /// Target is not offered by the managed cluster for the current version.
    NotAvailable { available: Vec<KubeVersion> },
    /// More than one minor version would be skipped.
    SkipsMinor { distance: i64 },
    /// Major version change or downgrade.
    Unsupported,
}

impl fmt::Display for UpgradePathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAvailable { available } => {
                let list = available
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "not in available upgrades [{list}]")
            }
            Self::SkipsMinor { distance } => {
                write!(f, "skips {} minor versions (at most 1 allowed)", distance - 1)
            }
            Self::Unsupported => write!(f, "major version changes and downgrades are not supported"),
        }
    }
}

/// Decide whether `current -> target` is an acceptable single upgrade step.
///
/// Accepted: the target is present in `available` and is either a patch bump
/// or exactly one minor ahead.
///
/// # Errors
///
/// Returns the first rule the path violates.
pub fn check_upgrade_path(
    current: &KubeVersion,
    target: &KubeVersion,
    available: &[KubeVersion],
) -> Result<(), UpgradePathError> {
    let distance = current
        .minor_distance(target)
        .ok_or(UpgradePathError::Unsupported)?;
    if distance < 0 || target <= current {
        return Err(UpgradePathError::Unsupported);
    }
    if distance > 1 {
        return Err(UpgradePathError::SkipsMinor { distance });
    }
    if !available.contains(target) {
        return Err(UpgradePathError::NotAvailable {
            available: available.to_vec(),
        });
    }
    Ok(())
}
