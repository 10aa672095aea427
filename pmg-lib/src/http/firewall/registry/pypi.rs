use std::{borrow::Cow, fmt, sync::LazyLock};

use rama::{
    error::BoxError,
    http::{Request, Response},
    net::{address::Domain, uri::util::percent_encoding},
    telemetry::tracing,
    utils::{
        collections::smallvec::SmallVec,
        str::smol_str::{SmolStr, StrExt as _},
    },
};
use regex::Regex;

use crate::package::{Ecosystem, PackageVersion};

use super::super::interceptor::{Interceptor, RequestAction};
use super::{RegistryConfigMap, RegistryCore, RegistryHostConfig};

/// PEP 440-ish version shape: optional epoch, release segments, and optional
/// pre/post/dev/local identifiers. Used to find the name/version split in
/// sdist filenames, where the name itself may contain hyphens.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)^v?(?:\d+!)?\d+(?:\.\d+)*(?:[._-]?(?:a|b|c|rc|alpha|beta|pre|preview)\.?\d*)?(?:(?:[._-]?post\.?\d*)|(?:-\d+))?(?:[._-]?dev\.?\d*)?(?:\+[a-z0-9]+(?:[._-][a-z0-9]+)*)?$",
    )
    .unwrap()
});

const SDIST_EXTS: &[&str] = &[".tar.gz", ".tar.bz2", ".tgz", ".zip"];

/// What a PyPI-family URL refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PyPiRequestPath {
    /// Simple-index HTML or JSON API metadata; never analyzed.
    Metadata { name: SmolStr },
    /// A wheel or sdist download from the files host.
    FileDownload { name: SmolStr, version: SmolStr },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum PyPiPathError {
    #[error("path does not name a package resource")]
    UnrecognizedPath,
    #[error("filename is neither a wheel nor a known sdist format")]
    UnrecognizedFilename,
    #[error("wheel filename does not carry enough segments")]
    MalformedWheel,
    #[error("no version component found in sdist filename")]
    NoVersion,
}

fn normalize_package_name(raw: &str) -> SmolStr {
    raw.to_lowercase_smolstr().replace_smolstr("_", "-")
}

fn percent_decode(input: &str) -> Cow<'_, str> {
    percent_encoding::percent_decode_str(input).decode_utf8_lossy()
}

/// Parse a `pypi.org` metadata path: `/simple/<name>/…` or
/// `/pypi/<name>[/<version>]/json`.
pub(crate) fn parse_pypi_index_path(path: &str) -> Result<PyPiRequestPath, PyPiPathError> {
    let segments: SmallVec<[Cow<'_, str>; 4]> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(percent_decode)
        .collect();

    match segments.as_slice() {
        [simple, name, ..] if simple == "simple" => Ok(PyPiRequestPath::Metadata {
            name: normalize_package_name(name),
        }),
        [pypi, name, json] if pypi == "pypi" && json == "json" => Ok(PyPiRequestPath::Metadata {
            name: normalize_package_name(name),
        }),
        [pypi, name, _version, json] if pypi == "pypi" && json == "json" => {
            Ok(PyPiRequestPath::Metadata {
                name: normalize_package_name(name),
            })
        }
        _ => Err(PyPiPathError::UnrecognizedPath),
    }
}

/// Parse a `files.pythonhosted.org` download path:
/// `/packages/<hash_dirs…>/<filename>`.
pub(crate) fn parse_pypi_files_path(path: &str) -> Result<PyPiRequestPath, PyPiPathError> {
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    if segments.next() != Some("packages") {
        return Err(PyPiPathError::UnrecognizedPath);
    }
    let filename = segments.last().ok_or(PyPiPathError::UnrecognizedPath)?;
    let filename = percent_decode(filename);
    parse_wheel_filename(&filename).or_else(|_| parse_sdist_filename(&filename))
}

/// Parse a wheel filename:
/// `<name>-<version>[-<build>]-<python>-<abi>-<platform>.whl`.
///
/// The last three `-`-separated parts are always tags. Of what remains, a
/// trailing all-numeric part is a build tag; otherwise everything before the
/// final part is the (possibly hyphenated) name.
pub(crate) fn parse_wheel_filename(filename: &str) -> Result<PyPiRequestPath, PyPiPathError> {
    let stem = filename
        .strip_suffix(".whl.metadata")
        .or_else(|| filename.strip_suffix(".whl"))
        .ok_or(PyPiPathError::UnrecognizedFilename)?;

    let parts: SmallVec<[&str; 8]> = stem.split('-').collect();
    if parts.len() < 5 {
        return Err(PyPiPathError::MalformedWheel);
    }

    // everything except the trailing python/abi/platform tags
    let remainder = &parts[..parts.len() - 3];

    let (name_parts, version) = match remainder {
        [name @ .., version, build]
            if !build.is_empty() && build.bytes().all(|b| b.is_ascii_digit()) && !name.is_empty() =>
        {
            (name, *version)
        }
        [name @ .., version] if !name.is_empty() => (name, *version),
        _ => return Err(PyPiPathError::MalformedWheel),
    };

    let name = name_parts.join("-");
    if name.is_empty() || version.is_empty() {
        return Err(PyPiPathError::MalformedWheel);
    }

    Ok(PyPiRequestPath::FileDownload {
        name: normalize_package_name(&name),
        version: SmolStr::from(version),
    })
}

/// Parse an sdist filename: `<name>-<version>.{tar.gz|tar.bz2|tgz|zip}`.
///
/// The name may contain hyphens, so the version is found by scanning from the
/// end for the last `-`-delimited component that looks like a PEP 440
/// version.
pub(crate) fn parse_sdist_filename(filename: &str) -> Result<PyPiRequestPath, PyPiPathError> {
    let working = filename.strip_suffix(".metadata").unwrap_or(filename);

    let stem = SDIST_EXTS
        .iter()
        .find_map(|ext| working.strip_suffix(ext))
        .ok_or(PyPiPathError::UnrecognizedFilename)?;

    for (idx, _) in stem.rmatch_indices('-') {
        let candidate = &stem[idx + 1..];
        if VERSION_RE.is_match(candidate) {
            let name = &stem[..idx];
            if name.is_empty() {
                return Err(PyPiPathError::NoVersion);
            }
            return Ok(PyPiRequestPath::FileDownload {
                name: normalize_package_name(name),
                version: SmolStr::from(candidate),
            });
        }
    }

    Err(PyPiPathError::NoVersion)
}

pub(in crate::http::firewall) struct PyPiInterceptor {
    core: RegistryCore,
    index_hosts: RegistryConfigMap,
    files_hosts: RegistryConfigMap,
}

impl PyPiInterceptor {
    pub(in crate::http::firewall) fn new(core: RegistryCore) -> Self {
        let index_hosts = [
            RegistryHostConfig::new("pypi.org"),
            RegistryHostConfig::new("pypi.python.org"),
            RegistryHostConfig::unsupported("test.pypi.org"),
        ]
        .into_iter()
        .collect();

        let files_hosts = [
            RegistryHostConfig::new("files.pythonhosted.org"),
            RegistryHostConfig::unsupported("test-files.pythonhosted.org"),
        ]
        .into_iter()
        .collect();

        Self {
            core,
            index_hosts,
            files_hosts,
        }
    }
}

impl fmt::Debug for PyPiInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PyPiInterceptor").finish()
    }
}

impl Interceptor for PyPiInterceptor {
    #[inline(always)]
    fn product_name(&self) -> &'static str {
        "PyPI"
    }

    #[inline(always)]
    fn match_domain(&self, domain: &Domain) -> bool {
        self.index_hosts.contains(domain.as_str()) || self.files_hosts.contains(domain.as_str())
    }

    async fn evaluate_response(&self, resp: Response) -> Result<Response, BoxError> {
        Ok(resp)
    }

    async fn evaluate_request(&self, req: Request) -> Result<RequestAction, BoxError> {
        let Some(domain) = crate::http::try_get_domain_for_req(&req) else {
            return Ok(RequestAction::Allow(req));
        };

        if self.index_hosts.resolve(domain.as_str()).is_some() {
            // the index only serves metadata and is never analyzed
            match parse_pypi_index_path(req.uri().path()) {
                Ok(PyPiRequestPath::Metadata { name }) => {
                    tracing::trace!(package = %name, "allowing pypi index request");
                }
                _ => tracing::trace!("allowing unrecognized pypi index request"),
            }
            return Ok(RequestAction::Allow(req));
        }

        let Some(host) = self.files_hosts.resolve(domain.as_str()).cloned() else {
            tracing::trace!("pypi interceptor did not match incoming request: passthrough");
            return Ok(RequestAction::Allow(req));
        };

        if !host.supported_for_analysis {
            tracing::trace!(host = %host.hostname, "pypi files host not supported for analysis: passthrough");
            return Ok(RequestAction::Allow(req));
        }

        let path = req.uri().path();
        match parse_pypi_files_path(path) {
            Ok(PyPiRequestPath::FileDownload { name, version }) => {
                let pkg = PackageVersion::new(Ecosystem::PyPi, name.as_str(), version.as_str());
                self.core.analyze_download(req, pkg).await
            }
            Ok(PyPiRequestPath::Metadata { name }) => {
                tracing::trace!(package = %name, "allowing pypi metadata request");
                Ok(RequestAction::Allow(req))
            }
            Err(err) => {
                tracing::debug!("pypi url {path} not recognized ({err}): passthrough");
                Ok(RequestAction::Allow(req))
            }
        }
    }
}
