use rama::telemetry::tracing;
use serde::{Deserialize, Serialize};

use super::{PackageVersion, Purl};

/// A trust-list entry as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPackageEntry {
    pub purl: String,
    #[serde(default)]
    pub reason: String,
}

/// A trust-list entry with its PURL pre-parsed at config-load time.
///
/// Trust lookup runs for every package ahead of analysis, so entries are
/// parsed once up front instead of on every match attempt.
#[derive(Debug, Clone)]
pub struct TrustedPackage {
    pub purl: String,
    pub reason: String,
    parsed: Purl,
}

impl TrustedPackage {
    /// Parse a config entry. Invalid PURLs yield `None`.
    pub fn from_entry(entry: &TrustedPackageEntry) -> Option<Self> {
        match Purl::parse(&entry.purl) {
            Ok(parsed) => Some(Self {
                purl: entry.purl.clone(),
                reason: entry.reason.clone(),
                parsed,
            }),
            Err(err) => {
                tracing::debug!(purl = %entry.purl, "skipping invalid trusted package entry: {err}");
                None
            }
        }
    }

    /// True iff ecosystem and (normalized) name match, and the entry either
    /// carries no version or its version equals the target's.
    pub fn matches(&self, pkg: &PackageVersion) -> bool {
        if self.parsed.ecosystem != *pkg.ecosystem() {
            return false;
        }
        if self.parsed.ecosystem.normalize_name(&self.parsed.name) != pkg.name() {
            return false;
        }
        match self.parsed.version.as_deref() {
            None | Some("") => true,
            Some(version) => version == pkg.version(),
        }
    }
}

/// Parse all config entries, silently skipping the invalid ones.
pub fn parse_trusted_packages(entries: &[TrustedPackageEntry]) -> Vec<TrustedPackage> {
    entries.iter().filter_map(TrustedPackage::from_entry).collect()
}

/// Trust check for a package coordinate. A missing coordinate is never trusted.
pub fn is_trusted_package(trusted: &[TrustedPackage], pkg: Option<&PackageVersion>) -> bool {
    let Some(pkg) = pkg else {
        return false;
    };
    trusted.iter().any(|entry| entry.matches(pkg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Ecosystem;

    fn entry(purl: &str) -> TrustedPackageEntry {
        TrustedPackageEntry {
            purl: purl.to_owned(),
            reason: "test".to_owned(),
        }
    }

    #[test]
    fn test_is_trusted_package() {
        let trusted = parse_trusted_packages(&[
            entry("pkg:npm/left-pad@1.3.0"),
            entry("pkg:npm/lodash"),
            entry("pkg:pypi/Requests"),
            entry("not-a-purl"),
        ]);
        assert_eq!(trusted.len(), 3, "invalid entries are skipped");

        let test_cases = vec![
            // exact version match
            (PackageVersion::new(Ecosystem::Npm, "left-pad", "1.3.0"), true),
            // version mismatch
            (PackageVersion::new(Ecosystem::Npm, "left-pad", "1.2.0"), false),
            // versionless entry matches all versions
            (PackageVersion::new(Ecosystem::Npm, "lodash", "4.17.21"), true),
            (PackageVersion::new(Ecosystem::Npm, "lodash", ""), true),
            // ecosystem mismatch
            (PackageVersion::new(Ecosystem::PyPi, "lodash", "4.17.21"), false),
            // pypi name normalization applies on both sides
            (PackageVersion::new(Ecosystem::PyPi, "requests", "2.28.0"), true),
            // unknown package
            (PackageVersion::new(Ecosystem::Npm, "express", "4.18.0"), false),
        ];

        for (pkg, expected) in test_cases {
            assert_eq!(
                is_trusted_package(&trusted, Some(&pkg)),
                expected,
                "package: {pkg}"
            );
        }
    }

    #[test]
    fn test_nil_package_is_never_trusted() {
        let trusted = parse_trusted_packages(&[entry("pkg:npm/lodash")]);
        assert!(!is_trusted_package(&trusted, None));
        assert!(!is_trusted_package(&[], None));
    }
}
