use std::fmt;

use rama::{
    error::BoxError,
    http::{Request, Response},
    net::address::Domain,
    telemetry::tracing,
    utils::{collections::smallvec::SmallVec, str::smol_str::SmolStr},
};

use crate::package::{Ecosystem, PackageVersion};

use super::super::interceptor::{Interceptor, RequestAction};
use super::{RegistryConfigMap, RegistryCore, RegistryHostConfig};

/// What an npm registry path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NpmRequestPath {
    /// Package or version metadata document; never analyzed (blocking
    /// metadata would break resolution for packages that merely depend on a
    /// malicious one).
    Metadata { name: SmolStr },
    /// An actual tarball download.
    Tarball { name: SmolStr, version: SmolStr },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum NpmPathError {
    #[error("unexpected number of path segments")]
    UnexpectedSegments,
    #[error("tarball filename is missing the .tgz suffix")]
    NotATarball,
    #[error("tarball filename does not carry the expected package prefix")]
    FilenameMismatch,
}

/// Parse an npm registry URL path.
///
/// Plain packages: `/<name>`, `/<name>/<version>` and
/// `/<name>/-/<name>-<version>.tgz`. Scoped packages prefix a `@scope`
/// segment, and scoped tarball filenames come in two shapes, tried in order:
/// `<scope_noat>-<name>-<version>.tgz` then `<name>-<version>.tgz`.
pub(crate) fn parse_npm_path(path: &str) -> Result<NpmRequestPath, NpmPathError> {
    let segments: SmallVec<[&str; 4]> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    match segments.as_slice() {
        [name] => Ok(NpmRequestPath::Metadata {
            name: SmolStr::from(*name),
        }),
        [scope, name] if scope.starts_with('@') => Ok(NpmRequestPath::Metadata {
            name: SmolStr::from(format!("{scope}/{name}")),
        }),
        [name, _version] => Ok(NpmRequestPath::Metadata {
            name: SmolStr::from(*name),
        }),
        [name, "-", filename] => {
            let version = parse_tarball_version(filename, &[name])?;
            Ok(NpmRequestPath::Tarball {
                name: SmolStr::from(*name),
                version,
            })
        }
        [scope, name, _version] if scope.starts_with('@') => Ok(NpmRequestPath::Metadata {
            name: SmolStr::from(format!("{scope}/{name}")),
        }),
        [scope, name, "-", filename] if scope.starts_with('@') => {
            let scope_noat = scope.trim_start_matches('@');
            let combined = format!("{scope_noat}-{name}");
            let version = parse_tarball_version(filename, &[combined.as_str(), name])?;
            Ok(NpmRequestPath::Tarball {
                name: SmolStr::from(format!("{scope}/{name}")),
                version,
            })
        }
        _ => Err(NpmPathError::UnexpectedSegments),
    }
}

/// Strip `.tgz` and the first matching `<prefix>-` off a tarball filename,
/// leaving the version.
fn parse_tarball_version(
    filename: &str,
    prefix_candidates: &[&str],
) -> Result<SmolStr, NpmPathError> {
    let stem = filename
        .strip_suffix(".tgz")
        .ok_or(NpmPathError::NotATarball)?;

    for prefix in prefix_candidates {
        if let Some(version) = stem
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            && !version.is_empty()
        {
            return Ok(SmolStr::from(version));
        }
    }

    Err(NpmPathError::FilenameMismatch)
}

pub(in crate::http::firewall) struct NpmInterceptor {
    core: RegistryCore,
    hosts: RegistryConfigMap,
}

impl NpmInterceptor {
    pub(in crate::http::firewall) fn new(core: RegistryCore) -> Self {
        let hosts = [
            RegistryHostConfig::new("registry.npmjs.org"),
            RegistryHostConfig::new("registry.npmjs.com"),
            RegistryHostConfig::new("registry.yarnpkg.com"),
        ]
        .into_iter()
        .collect();

        Self { core, hosts }
    }
}

impl fmt::Debug for NpmInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpmInterceptor").finish()
    }
}

impl Interceptor for NpmInterceptor {
    #[inline(always)]
    fn product_name(&self) -> &'static str {
        "Npm"
    }

    #[inline(always)]
    fn match_domain(&self, domain: &Domain) -> bool {
        self.hosts.contains(domain.as_str())
    }

    async fn evaluate_response(&self, resp: Response) -> Result<Response, BoxError> {
        Ok(resp)
    }

    async fn evaluate_request(&self, req: Request) -> Result<RequestAction, BoxError> {
        let Some(host) = crate::http::try_get_domain_for_req(&req)
            .and_then(|domain| self.hosts.resolve(domain.as_str()).cloned())
        else {
            tracing::trace!("npm interceptor did not match incoming request: passthrough");
            return Ok(RequestAction::Allow(req));
        };

        if !host.supported_for_analysis {
            tracing::trace!(host = %host.hostname, "npm host not supported for analysis: passthrough");
            return Ok(RequestAction::Allow(req));
        }

        let path = req.uri().path();
        match parse_npm_path(path) {
            Ok(NpmRequestPath::Metadata { name }) => {
                tracing::trace!(package = %name, "allowing npm metadata request");
                Ok(RequestAction::Allow(req))
            }
            Ok(NpmRequestPath::Tarball { name, version }) => {
                let pkg = PackageVersion::new(Ecosystem::Npm, name.as_str(), version.as_str());
                self.core.analyze_download(req, pkg).await
            }
            Err(err) => {
                // parse failures fail open: an unknown URL layout must never
                // break the registry
                tracing::debug!("npm url {path} not recognized ({err}): passthrough");
                Ok(RequestAction::Allow(req))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_npm_path() {
        let test_cases = vec![
            // plain metadata
            ("/left-pad", Some(NpmRequestPath::Metadata { name: "left-pad".into() })),
            (
                "/left-pad/1.3.0",
                Some(NpmRequestPath::Metadata { name: "left-pad".into() }),
            ),
            // plain tarball
            (
                "/left-pad/-/left-pad-1.3.0.tgz",
                Some(NpmRequestPath::Tarball {
                    name: "left-pad".into(),
                    version: "1.3.0".into(),
                }),
            ),
            (
                "/nyc-config/-/nyc-config-10.0.0.tgz",
                Some(NpmRequestPath::Tarball {
                    name: "nyc-config".into(),
                    version: "10.0.0".into(),
                }),
            ),
            // scoped metadata
            (
                "/@types/node",
                Some(NpmRequestPath::Metadata { name: "@types/node".into() }),
            ),
            (
                "/@types/node/18.0.0",
                Some(NpmRequestPath::Metadata { name: "@types/node".into() }),
            ),
            // scoped tarball, filename form F2: <name>-<version>.tgz
            (
                "/@types/node/-/node-18.0.0.tgz",
                Some(NpmRequestPath::Tarball {
                    name: "@types/node".into(),
                    version: "18.0.0".into(),
                }),
            ),
            (
                "/@prisma/studio-core-licensed/-/studio-core-licensed-0.0.0-dev.202601011229.tgz",
                Some(NpmRequestPath::Tarball {
                    name: "@prisma/studio-core-licensed".into(),
                    version: "0.0.0-dev.202601011229".into(),
                }),
            ),
            // scoped tarball, filename form F1: <scope_noat>-<name>-<version>.tgz
            (
                "/@acme/widgets/-/acme-widgets-2.1.0.tgz",
                Some(NpmRequestPath::Tarball {
                    name: "@acme/widgets".into(),
                    version: "2.1.0".into(),
                }),
            ),
            // versions that themselves contain hyphens
            (
                "/pkg/-/pkg-1.0.0-beta.2.tgz",
                Some(NpmRequestPath::Tarball {
                    name: "pkg".into(),
                    version: "1.0.0-beta.2".into(),
                }),
            ),
            // errors: wrong prefix, wrong extension, too many segments
            ("/left-pad/-/other-name-1.0.0.tgz", None),
            ("/left-pad/-/left-pad-1.3.0.tar.gz", None),
            ("/a/b/c/d/e", None),
            ("/@scope/name/-/name-1.0.0.zip", None),
        ];

        for (input, expected) in test_cases {
            let result = parse_npm_path(input);
            match expected {
                Some(expected) => {
                    let parsed = result
                        .unwrap_or_else(|err| panic!("expected Ok for path {input}, got {err}"));
                    assert_eq!(parsed, expected, "path: {input}");
                }
                None => {
                    assert!(result.is_err(), "expected Err for path: {input}");
                }
            }
        }
    }

    #[test]
    fn test_scoped_filename_forms_are_tried_in_order() {
        // F1 (`a-a-`) must win over F2 (`a-`) when both prefixes match
        let parsed = parse_npm_path("/@a/a/-/a-a-1.0.0.tgz").unwrap();
        assert_eq!(
            parsed,
            NpmRequestPath::Tarball {
                name: "@a/a".into(),
                version: "1.0.0".into(),
            },
        );
    }
}
