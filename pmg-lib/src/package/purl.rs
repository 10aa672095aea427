use std::{fmt, str::FromStr};

use rama::utils::str::smol_str::SmolStr;

use super::{Ecosystem, PackageVersion};

/// A parsed Package URL: `pkg:<ecosystem>/<name>[@<version>]`.
///
/// Unknown ecosystems are not an error here, they parse into
/// [`Ecosystem::Other`] so callers can decide what to do with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purl {
    pub ecosystem: Ecosystem,
    pub name: SmolStr,
    pub version: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PurlError {
    #[error("purl is missing the pkg: scheme")]
    MissingScheme,
    #[error("purl is missing an ecosystem")]
    MissingEcosystem,
    #[error("purl is missing a package name")]
    MissingName,
}

impl Purl {
    pub fn parse(input: &str) -> Result<Self, PurlError> {
        let rest = input
            .trim()
            .strip_prefix("pkg:")
            .ok_or(PurlError::MissingScheme)?;

        let (ecosystem, rest) = rest.split_once('/').ok_or(PurlError::MissingEcosystem)?;
        if ecosystem.is_empty() {
            return Err(PurlError::MissingEcosystem);
        }

        // A scoped npm name starts with '@'; only an '@' past the first byte
        // separates name from version.
        let (name, version) = match rest.rsplit_once('@') {
            Some((prefix, suffix)) if !prefix.is_empty() => (prefix, Some(suffix)),
            _ => (rest, None),
        };
        if name.is_empty() {
            return Err(PurlError::MissingName);
        }

        let Ok(ecosystem) = ecosystem.parse::<Ecosystem>();

        Ok(Self {
            ecosystem,
            name: SmolStr::from(name),
            version: version.map(SmolStr::from),
        })
    }

    /// Turn this PURL into a canonical (normalized) coordinate.
    pub fn to_package_version(&self) -> PackageVersion {
        PackageVersion::new(
            self.ecosystem.clone(),
            self.name.as_str(),
            self.version.as_deref().unwrap_or_default(),
        )
    }
}

impl FromStr for Purl {
    type Err = PurlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Purl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg:{}/{}", self.ecosystem, self.name)?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_purl() {
        let test_cases = vec![
            (
                "pkg:npm/left-pad@1.3.0",
                Some((Ecosystem::Npm, "left-pad", Some("1.3.0"))),
            ),
            (
                "pkg:npm/@prisma/studio-core-licensed@0.0.0-dev.202601011229",
                Some((
                    Ecosystem::Npm,
                    "@prisma/studio-core-licensed",
                    Some("0.0.0-dev.202601011229"),
                )),
            ),
            (
                "pkg:npm/@scope/name",
                Some((Ecosystem::Npm, "@scope/name", None)),
            ),
            (
                "pkg:pypi/requests@2.28.0",
                Some((Ecosystem::PyPi, "requests", Some("2.28.0"))),
            ),
            ("pkg:pypi/requests", Some((Ecosystem::PyPi, "requests", None))),
            (
                "pkg:nuget/Some.Package@1.0",
                Some((
                    Ecosystem::Other("nuget".into()),
                    "Some.Package",
                    Some("1.0"),
                )),
            ),
            ("npm/left-pad", None),
            ("pkg:", None),
            ("pkg:npm/", None),
            ("pkg:/name", None),
        ];

        for (input, expected) in test_cases {
            let result = Purl::parse(input);
            match expected {
                Some((ecosystem, name, version)) => {
                    let purl = result.unwrap_or_else(|err| {
                        panic!("expected Ok for input: {input}, got {err}")
                    });
                    assert_eq!(purl.ecosystem, ecosystem, "input: {input}");
                    assert_eq!(purl.name, name, "input: {input}");
                    assert_eq!(purl.version.as_deref(), version, "input: {input}");
                }
                None => {
                    assert!(result.is_err(), "expected Err for input: {input}");
                }
            }
        }
    }

    #[test]
    fn test_purl_round_trip() {
        for input in [
            "pkg:npm/left-pad@1.3.0",
            "pkg:npm/@scope/name@2.0.0",
            "pkg:pypi/requests",
            "pkg:maven/org.apache.commons.lang3@3.12.0",
        ] {
            let purl = Purl::parse(input).unwrap();
            assert_eq!(purl.to_string(), input, "round trip for: {input}");
            let reparsed = Purl::parse(&purl.to_string()).unwrap();
            assert_eq!(purl, reparsed, "reparse for: {input}");
        }
    }
}
