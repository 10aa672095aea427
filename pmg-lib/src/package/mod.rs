use std::{fmt, str::FromStr};

use rama::utils::str::smol_str::{SmolStr, StrExt as _, ToSmolStr as _};

pub mod purl;
pub mod trust;

pub use self::purl::Purl;
pub use self::trust::{TrustedPackage, TrustedPackageEntry, is_trusted_package};

/// Package ecosystem a coordinate belongs to.
///
/// Ecosystems we have no registry support for are kept as [`Ecosystem::Other`]
/// so that trust-list entries and analyzer replies for them still round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    Npm,
    PyPi,
    Maven,
    RubyGems,
    Go,
    Cargo,
    Other(SmolStr),
}

impl Ecosystem {
    pub fn as_str(&self) -> &str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::PyPi => "pypi",
            Ecosystem::Maven => "maven",
            Ecosystem::RubyGems => "gem",
            Ecosystem::Go => "golang",
            Ecosystem::Cargo => "cargo",
            Ecosystem::Other(s) => s.as_str(),
        }
    }

    /// Normalize a raw package name according to the ecosystem's rules.
    ///
    /// PyPI package names are case-insensitive and treat `_` and `-` as
    /// equivalent (PEP 503); npm and the rest preserve the name verbatim.
    pub fn normalize_name(&self, raw: &str) -> SmolStr {
        match self {
            Ecosystem::PyPi => raw.trim().to_lowercase_smolstr().replace_smolstr("_", "-"),
            _ => SmolStr::from(raw.trim()),
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Ecosystem {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ecosystem::Npm,
            "pypi" => Ecosystem::PyPi,
            "maven" => Ecosystem::Maven,
            "gem" | "rubygems" => Ecosystem::RubyGems,
            "golang" | "go" => Ecosystem::Go,
            "cargo" | "crates" => Ecosystem::Cargo,
            other => Ecosystem::Other(other.to_smolstr()),
        })
    }
}

/// A canonical `(ecosystem, name, version)` coordinate.
///
/// The name is normalized at construction time per the ecosystem's rules,
/// which makes equality and hashing purely structural. An empty version
/// means "unresolved / all versions".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageVersion {
    ecosystem: Ecosystem,
    name: SmolStr,
    version: SmolStr,
}

impl PackageVersion {
    pub fn new(ecosystem: Ecosystem, name: impl AsRef<str>, version: impl AsRef<str>) -> Self {
        let name = ecosystem.normalize_name(name.as_ref());
        Self {
            ecosystem,
            name,
            version: SmolStr::from(version.as_ref().trim()),
        }
    }

    /// Coordinate without a bound version ("all versions").
    pub fn unversioned(ecosystem: Ecosystem, name: impl AsRef<str>) -> Self {
        Self::new(ecosystem, name, "")
    }

    pub fn ecosystem(&self) -> &Ecosystem {
        &self.ecosystem
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_resolved(&self) -> bool {
        !self.version.is_empty()
    }

    /// Same coordinate with the version replaced.
    pub fn with_version(&self, version: impl AsRef<str>) -> Self {
        Self {
            ecosystem: self.ecosystem.clone(),
            name: self.name.clone(),
            version: SmolStr::from(version.as_ref().trim()),
        }
    }

    /// Canonical Package URL string form.
    pub fn purl(&self) -> String {
        if self.version.is_empty() {
            format!("pkg:{}/{}", self.ecosystem, self.name)
        } else {
            format!("pkg:{}/{}@{}", self.ecosystem, self.name, self.version)
        }
    }

    /// Key used by the analysis cache: `<ecosystem>:<name>:<version>`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.ecosystem, self.name, self.version)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg:{}/{}", self.ecosystem, self.name)?;
        if !self.version.is_empty() {
            write!(f, "@{}", self.version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecosystem_round_trip() {
        for (input, expected) in [
            ("npm", Ecosystem::Npm),
            ("NPM", Ecosystem::Npm),
            ("pypi", Ecosystem::PyPi),
            ("gem", Ecosystem::RubyGems),
            ("rubygems", Ecosystem::RubyGems),
            ("golang", Ecosystem::Go),
            ("cargo", Ecosystem::Cargo),
            ("nuget", Ecosystem::Other("nuget".into())),
        ] {
            let Ok(parsed) = input.parse::<Ecosystem>();
            assert_eq!(parsed, expected, "input: {input}");
        }
    }

    #[test]
    fn test_name_normalization() {
        let pkg = PackageVersion::new(Ecosystem::PyPi, "Django_Rest_Framework", "3.14.0");
        assert_eq!(pkg.name(), "django-rest-framework");

        let pkg = PackageVersion::new(Ecosystem::Npm, "@Scope/Name", "1.0.0");
        assert_eq!(pkg.name(), "@Scope/Name");
    }

    #[test]
    fn test_structural_equality() {
        let a = PackageVersion::new(Ecosystem::PyPi, "foo_bar", "1.0");
        let b = PackageVersion::new(Ecosystem::PyPi, "FOO-BAR", "1.0");
        assert_eq!(a, b);

        let c = PackageVersion::new(Ecosystem::Npm, "foo-bar", "1.0");
        assert_ne!(a, c);
    }

    #[test]
    fn test_purl_form() {
        let pkg = PackageVersion::new(Ecosystem::Npm, "left-pad", "1.3.0");
        assert_eq!(pkg.purl(), "pkg:npm/left-pad@1.3.0");
        assert_eq!(pkg.cache_key(), "npm:left-pad:1.3.0");

        let pkg = PackageVersion::unversioned(Ecosystem::PyPi, "requests");
        assert_eq!(pkg.purl(), "pkg:pypi/requests");
        assert!(!pkg.is_resolved());
    }
}
