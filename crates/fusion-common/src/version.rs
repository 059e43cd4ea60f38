//! Version compatibility between Storage Scale releases and OpenShift
//!
//! Two version streams move independently: the product version declared on
//! the FusionAccess resource and the platform version the cluster is running.
//! The built-in [`CompatibilityMatrix`] maps each product release to the
//! platform ranges it supports. Evaluation is pure and never fails: anything
//! that does not parse is simply unsupported.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::crd::{ClusterVersionStatus, UpdateState};
use crate::Error;

/// Repository of the image used to check registry entitlement
pub const TEST_IMAGE_REPOSITORY: &str = "cp.icr.io/cp/spectrum/scale/ibm-spectrum-scale-core-init";

/// Storage Scale release number: `major.minor.patch.build`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductVersion {
    /// Major release
    pub major: u32,
    /// Minor release
    pub minor: u32,
    /// Patch level
    pub patch: u32,
    /// Build / efix level
    pub build: u32,
}

impl ProductVersion {
    /// Construct a version from its four components
    pub const fn new(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }
}

impl FromStr for ProductVersion {
    type Err = Error;

    /// Exactly four dot-separated decimal components, nothing else.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            Error::validation_for_field(
                s,
                "spec.productVersion",
                format!("'{s}' is not a major.minor.patch.build version"),
            )
        };
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }
        let mut nums = [0u32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(nums[0], nums[1], nums[2], nums[3]))
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

/// OpenShift release number, semver shaped
///
/// A missing patch component is read as zero (`4.9` is `4.9.0`). Build
/// metadata after `+` is ignored. A pre-release orders before its release.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlatformVersion {
    /// Major release
    pub major: u32,
    /// Minor release
    pub minor: u32,
    /// Patch level
    pub patch: u32,
    /// Pre-release tag (e.g. `rc.1`, `0.nightly-2024-05-01`)
    pub pre: Option<String>,
}

impl PlatformVersion {
    /// Construct a release (non pre-release) version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    fn triple(&self) -> [u32; 3] {
        [self.major, self.minor, self.patch]
    }
}

impl Ord for PlatformVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple()
            .cmp(&other.triple())
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for PlatformVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for PlatformVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::validation(format!("'{s}' is not a platform version"));
        let trimmed = s.trim().trim_start_matches('v');
        let core_and_pre = trimmed.split('+').next().unwrap_or_default();
        let (core, pre) = match core_and_pre.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (core_and_pre, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid());
        }
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
            pre,
        })
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

/// A contiguous span of supported platform versions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformRange {
    /// Inclusive lower bound
    pub min: [u32; 3],
    /// Upper bound
    pub max: [u32; 3],
    /// Whether `max` itself is supported
    pub max_inclusive: bool,
}

impl PlatformRange {
    /// `[min, max)`
    pub const fn half_open(min: [u32; 3], max: [u32; 3]) -> Self {
        Self {
            min,
            max,
            max_inclusive: false,
        }
    }

    /// `[min, max]`
    pub const fn closed(min: [u32; 3], max: [u32; 3]) -> Self {
        Self {
            min,
            max,
            max_inclusive: true,
        }
    }

    /// Whether the version falls inside this range
    pub fn contains(&self, version: &PlatformVersion) -> bool {
        let [a, b, c] = self.min;
        let [x, y, z] = self.max;
        let min = PlatformVersion::new(a, b, c);
        let max = PlatformVersion::new(x, y, z);
        if *version < min {
            return false;
        }
        if self.max_inclusive {
            *version <= max
        } else {
            *version < max
        }
    }
}

/// One product release and the platforms it supports
#[derive(Clone, Copy, Debug)]
pub struct MatrixEntry {
    /// Product release
    pub product: ProductVersion,
    /// Supported platform ranges
    pub platforms: &'static [PlatformRange],
}

const BUILTIN_ENTRIES: &[MatrixEntry] = &[
    MatrixEntry {
        product: ProductVersion::new(5, 1, 5, 0),
        platforms: &[PlatformRange::half_open([4, 9, 0], [4, 11, 0])],
    },
    MatrixEntry {
        product: ProductVersion::new(5, 1, 7, 0),
        platforms: &[PlatformRange::half_open([4, 10, 0], [4, 13, 0])],
    },
    MatrixEntry {
        product: ProductVersion::new(5, 1, 9, 1),
        platforms: &[PlatformRange::half_open([4, 12, 0], [4, 15, 0])],
    },
    MatrixEntry {
        product: ProductVersion::new(5, 2, 1, 1),
        platforms: &[PlatformRange::half_open([4, 14, 0], [4, 17, 0])],
    },
    MatrixEntry {
        product: ProductVersion::new(5, 2, 2, 0),
        platforms: &[PlatformRange::half_open([4, 15, 0], [4, 18, 0])],
    },
    MatrixEntry {
        product: ProductVersion::new(5, 2, 3, 0),
        platforms: &[
            PlatformRange::half_open([4, 16, 0], [4, 18, 0]),
            PlatformRange::closed([4, 18, 0], [4, 18, 9]),
        ],
    },
];

/// Static table of supported product/platform combinations
#[derive(Clone, Copy, Debug)]
pub struct CompatibilityMatrix {
    entries: &'static [MatrixEntry],
}

impl Default for CompatibilityMatrix {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CompatibilityMatrix {
    /// The matrix shipped with this operator
    pub const fn builtin() -> Self {
        Self {
            entries: BUILTIN_ENTRIES,
        }
    }

    /// Look up a product release
    pub fn entry(&self, product: &ProductVersion) -> Option<&MatrixEntry> {
        self.entries.iter().find(|e| e.product == *product)
    }

    /// Whether `product` (as declared by the user) supports `platform`
    ///
    /// Unparseable or unknown product versions are unsupported.
    pub fn is_supported(&self, product: &str, platform: &PlatformVersion) -> bool {
        let Ok(product) = product.parse::<ProductVersion>() else {
            return false;
        };
        self.entry(&product)
            .map(|e| e.platforms.iter().any(|r| r.contains(platform)))
            .unwrap_or(false)
    }

    /// Image whose pull proves the registry credential works for `product`
    pub fn test_image(&self, product: &str) -> Result<String, Error> {
        let parsed: ProductVersion = product.parse()?;
        if self.entry(&parsed).is_none() {
            return Err(Error::validation_for_field(
                product,
                "spec.productVersion",
                format!("Storage Scale {parsed} is not a known release"),
            ));
        }
        Ok(format!("{TEST_IMAGE_REPOSITORY}:v{parsed}"))
    }
}

/// Whether `product` supports `platform` according to the built-in matrix
pub fn is_supported(product: &str, platform: &PlatformVersion) -> bool {
    CompatibilityMatrix::builtin().is_supported(product, platform)
}

/// Platform version the cluster is actually running
///
/// The most recent `Completed` history entry wins (history is newest first).
/// Without one, the cluster is mid-install and the desired version is used.
pub fn current_platform_version(status: &ClusterVersionStatus) -> Result<PlatformVersion, Error> {
    let raw = status
        .history
        .iter()
        .find(|h| h.state == UpdateState::Completed)
        .map(|h| h.version.as_str())
        .unwrap_or(status.desired.version.as_str());

    if raw.is_empty() {
        return Err(Error::validation_for(
            crate::crd::CLUSTER_VERSION_NAME,
            "cluster version reports neither a completed nor a desired version",
        ));
    }
    raw.parse()
}

/// How an unsupported product/platform combination is handled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Reject the request / stop the reconcile
    Enforce,
    /// Log and surface a warning, then continue
    #[default]
    WarnOnly,
    /// Skip the check entirely
    Ignore,
}

/// Outcome of applying a [`VersionPolicy`] to a compatibility result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionVerdict {
    /// Nothing to report
    Allowed,
    /// Continue, but tell someone
    Warn,
    /// Stop here
    Deny,
}

impl VersionPolicy {
    /// Map a compatibility result onto what the caller should do
    pub fn evaluate(self, supported: bool) -> VersionVerdict {
        match (self, supported) {
            (VersionPolicy::Ignore, _) | (_, true) => VersionVerdict::Allowed,
            (VersionPolicy::WarnOnly, false) => VersionVerdict::Warn,
            (VersionPolicy::Enforce, false) => VersionVerdict::Deny,
        }
    }

    /// Whether the platform version has to be read at all
    pub fn is_checked(self) -> bool {
        self != VersionPolicy::Ignore
    }
}

impl FromStr for VersionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "enforce" => Ok(VersionPolicy::Enforce),
            "warnonly" | "warn" => Ok(VersionPolicy::WarnOnly),
            "ignore" => Ok(VersionPolicy::Ignore),
            _ => Err(Error::validation(format!(
                "unknown version policy '{s}' (expected enforce, warn-only or ignore)"
            ))),
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPolicy::Enforce => write!(f, "enforce"),
            VersionPolicy::WarnOnly => write!(f, "warn-only"),
            VersionPolicy::Ignore => write!(f, "ignore"),
        }
    }
}

/// Human readable explanation of an unsupported combination
pub fn unsupported_message(product: &str, platform: &PlatformVersion) -> String {
    format!("Storage Scale {product} is not supported on OpenShift {platform}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Release, UpdateHistory};

    fn platform(s: &str) -> PlatformVersion {
        s.parse().unwrap()
    }

    #[test]
    fn compatibility_fixture() {
        let cases = [
            ("5.1.5.0", "4.9.0", true),
            ("5.1.5.0", "4.12.1", false),
            ("5.1.7.0", "4.11.43", true),
            ("5.1.7.0", "4.13.34", false),
            ("5.1.9.1", "4.12.7", true),
            ("5.1.9.1", "4.15.0", false),
            ("5.2.2.0", "4.17.3", true),
            ("5.2.2.0", "4.18.1", false),
            ("5.2.2.0", "4.15.17", true),
            ("invalid_version", "4.9", false),
        ];
        for (product, plat, expected) in cases {
            assert_eq!(
                is_supported(product, &platform(plat)),
                expected,
                "{product} on {plat}"
            );
        }
    }

    #[test]
    fn unknown_product_release_is_unsupported() {
        assert!(!is_supported("9.9.9.9", &platform("4.15.0")));
        assert!(!is_supported("5.2.2", &platform("4.15.0")));
        assert!(!is_supported("5.2.2.0.1", &platform("4.15.0")));
        assert!(!is_supported("", &platform("4.15.0")));
        assert!(!is_supported(" 5.2.2.0", &platform("4.15.0")));
    }

    #[test]
    fn closed_range_includes_its_upper_bound() {
        assert!(is_supported("5.2.3.0", &platform("4.18.9")));
        assert!(!is_supported("5.2.3.0", &platform("4.18.10")));
        assert!(is_supported("5.2.3.0", &platform("4.17.20")));
    }

    #[test]
    fn pre_release_sorts_before_its_release() {
        assert!(platform("4.15.0-rc.1") < platform("4.15.0"));
        assert!(!is_supported("5.2.2.0", &platform("4.15.0-rc.1")));
        assert!(is_supported("5.2.2.0", &platform("4.16.0-rc.1")));
    }

    #[test]
    fn platform_version_parsing() {
        assert_eq!(platform("4.9"), PlatformVersion::new(4, 9, 0));
        assert_eq!(platform("v4.12.1"), PlatformVersion::new(4, 12, 1));
        assert_eq!(platform("4.12.1+abc"), PlatformVersion::new(4, 12, 1));
        assert_eq!(platform("4.16.0-0.nightly").pre.as_deref(), Some("0.nightly"));
        assert!("4".parse::<PlatformVersion>().is_err());
        assert!("4.x.1".parse::<PlatformVersion>().is_err());
        assert!("4.12.1-".parse::<PlatformVersion>().is_err());
        assert!("".parse::<PlatformVersion>().is_err());
    }

    #[test]
    fn product_version_parsing_is_strict() {
        let v: ProductVersion = "5.2.2.0".parse().unwrap();
        assert_eq!(v, ProductVersion::new(5, 2, 2, 0));
        assert_eq!(v.to_string(), "5.2.2.0");
        assert!("5.2.2".parse::<ProductVersion>().is_err());
        assert!("5.2.+2.0".parse::<ProductVersion>().is_err());
        assert!("5.2..0".parse::<ProductVersion>().is_err());
        assert!("v5.2.2.0".parse::<ProductVersion>().is_err());
    }

    #[test]
    fn test_image_tracks_the_product_release() {
        let matrix = CompatibilityMatrix::builtin();
        assert_eq!(
            matrix.test_image("5.2.2.0").unwrap(),
            "cp.icr.io/cp/spectrum/scale/ibm-spectrum-scale-core-init:v5.2.2.0"
        );
        assert!(matrix.test_image("9.9.9.9").is_err());
        assert!(matrix.test_image("garbage").is_err());
    }

    fn status(history: Vec<(UpdateState, &str)>, desired: &str) -> ClusterVersionStatus {
        ClusterVersionStatus {
            desired: Release {
                version: desired.to_string(),
                image: None,
            },
            history: history
                .into_iter()
                .map(|(state, version)| UpdateHistory {
                    state,
                    version: version.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn completed_history_entry_wins_over_desired() {
        let s = status(vec![(UpdateState::Completed, "4.6.1")], "4.7.0");
        assert_eq!(current_platform_version(&s).unwrap(), platform("4.6.1"));
    }

    #[test]
    fn partial_history_falls_back_to_desired() {
        let s = status(vec![(UpdateState::Partial, "4.6.1")], "4.7.0");
        assert_eq!(current_platform_version(&s).unwrap(), platform("4.7.0"));
    }

    #[test]
    fn in_flight_upgrade_reports_the_last_completed_version() {
        let s = status(
            vec![
                (UpdateState::Partial, "4.16.2"),
                (UpdateState::Completed, "4.15.17"),
                (UpdateState::Completed, "4.14.9"),
            ],
            "4.16.2",
        );
        assert_eq!(current_platform_version(&s).unwrap(), platform("4.15.17"));
    }

    #[test]
    fn empty_cluster_version_is_an_error() {
        assert!(current_platform_version(&ClusterVersionStatus::default()).is_err());
    }

    #[test]
    fn policy_verdicts() {
        assert_eq!(VersionPolicy::Enforce.evaluate(false), VersionVerdict::Deny);
        assert_eq!(VersionPolicy::Enforce.evaluate(true), VersionVerdict::Allowed);
        assert_eq!(VersionPolicy::WarnOnly.evaluate(false), VersionVerdict::Warn);
        assert_eq!(VersionPolicy::Ignore.evaluate(false), VersionVerdict::Allowed);
        assert_eq!(VersionPolicy::default(), VersionPolicy::WarnOnly);
        assert!(!VersionPolicy::Ignore.is_checked());
    }

    #[test]
    fn policy_parses_cli_spellings() {
        assert_eq!("enforce".parse::<VersionPolicy>().unwrap(), VersionPolicy::Enforce);
        assert_eq!("warn-only".parse::<VersionPolicy>().unwrap(), VersionPolicy::WarnOnly);
        assert_eq!("WarnOnly".parse::<VersionPolicy>().unwrap(), VersionPolicy::WarnOnly);
        assert_eq!("IGNORE".parse::<VersionPolicy>().unwrap(), VersionPolicy::Ignore);
        assert!("strict".parse::<VersionPolicy>().is_err());
        assert_eq!(VersionPolicy::WarnOnly.to_string(), "warn-only");
    }
}
