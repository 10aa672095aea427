use std::{
    collections::{HashSet, VecDeque},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    http::{Body, Method, Request, Response, Uri, body::util::BodyExt as _},
    telemetry::tracing,
    utils::str::smol_str::SmolStr,
};

use crate::package::{Ecosystem, PackageVersion};

/// Resolves versions and dependency closures against the upstream registries.
///
/// Real dependency resolution belongs to the package manager; this walk only
/// needs coordinates to analyze, so ranges collapse to the latest published
/// version.
pub trait DependencyResolver: Send + Sync + 'static {
    /// The latest published version for an unbound coordinate.
    fn latest_version(
        &self,
        pkg: PackageVersion,
    ) -> impl Future<Output = Result<SmolStr, BoxError>> + Send + '_;

    /// Transitive dependency coordinates of a resolved package, bounded by
    /// `max_depth`.
    fn dependency_closure(
        &self,
        pkg: PackageVersion,
        max_depth: u32,
        include_dev: bool,
    ) -> impl Future<Output = Result<Vec<PackageVersion>, BoxError>> + Send + '_;

    fn into_dyn(self) -> DynDependencyResolver
    where
        Self: Sized,
    {
        DynDependencyResolver {
            inner: Arc::new(self),
        }
    }
}

#[allow(clippy::type_complexity)]
trait DynDependencyResolverInner {
    fn dyn_latest_version(
        &self,
        pkg: PackageVersion,
    ) -> Pin<Box<dyn Future<Output = Result<SmolStr, BoxError>> + Send + '_>>;

    fn dyn_dependency_closure(
        &self,
        pkg: PackageVersion,
        max_depth: u32,
        include_dev: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PackageVersion>, BoxError>> + Send + '_>>;
}

impl<R: DependencyResolver> DynDependencyResolverInner for R {
    #[inline(always)]
    fn dyn_latest_version(
        &self,
        pkg: PackageVersion,
    ) -> Pin<Box<dyn Future<Output = Result<SmolStr, BoxError>> + Send + '_>> {
        Box::pin(self.latest_version(pkg))
    }

    #[inline(always)]
    fn dyn_dependency_closure(
        &self,
        pkg: PackageVersion,
        max_depth: u32,
        include_dev: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PackageVersion>, BoxError>> + Send + '_>> {
        Box::pin(self.dependency_closure(pkg, max_depth, include_dev))
    }
}

/// A dyn-patched [`DependencyResolver`].
pub struct DynDependencyResolver {
    inner: Arc<dyn DynDependencyResolverInner + Send + Sync + 'static>,
}

impl Clone for DynDependencyResolver {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for DynDependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynDependencyResolver").finish()
    }
}

impl DependencyResolver for DynDependencyResolver {
    #[inline(always)]
    fn latest_version(
        &self,
        pkg: PackageVersion,
    ) -> impl Future<Output = Result<SmolStr, BoxError>> + Send + '_ {
        self.inner.dyn_latest_version(pkg)
    }

    #[inline(always)]
    fn dependency_closure(
        &self,
        pkg: PackageVersion,
        max_depth: u32,
        include_dev: bool,
    ) -> impl Future<Output = Result<Vec<PackageVersion>, BoxError>> + Send + '_ {
        self.inner.dyn_dependency_closure(pkg, max_depth, include_dev)
    }

    #[inline(always)]
    fn into_dyn(self) -> DynDependencyResolver {
        self
    }
}

/// Registry-backed resolver speaking the npm registry document format and
/// the PyPI JSON API over an injected HTTPS client.
pub struct RegistryResolver<C> {
    client: C,
    npm_registry: String,
    pypi_registry: String,
}

impl<C> RegistryResolver<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            npm_registry: "https://registry.npmjs.org".to_owned(),
            pypi_registry: "https://pypi.org".to_owned(),
        }
    }
}

impl<C> std::fmt::Debug for RegistryResolver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryResolver").finish()
    }
}

impl<C> RegistryResolver<C>
where
    C: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    async fn fetch_json(&self, uri: Uri) -> Result<serde_json::Value, BoxError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .context("build registry metadata request")?;

        let resp = self.client.serve(req).await.map_err(Into::into)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BoxError::from(format!(
                "registry replied with unexpected status: {status}"
            )));
        }

        let (_, body) = resp.into_parts();
        let bytes = body
            .collect()
            .await
            .context("collect registry metadata body")?
            .to_bytes();
        serde_json::from_slice(&bytes)
            .context("decode registry metadata as JSON")
            .map_err(Into::into)
    }

    async fn npm_latest(&self, name: &str) -> Result<SmolStr, BoxError> {
        let uri: Uri = format!("{}/{name}", self.npm_registry)
            .parse()
            .context("build npm metadata uri")?;
        let doc = self.fetch_json(uri).await?;
        doc.get("dist-tags")
            .and_then(|tags| tags.get("latest"))
            .and_then(|latest| latest.as_str())
            .map(SmolStr::from)
            .ok_or_else(|| BoxError::from(format!("npm package {name} has no latest dist-tag")))
    }

    async fn pypi_latest(&self, name: &str) -> Result<SmolStr, BoxError> {
        let uri: Uri = format!("{}/pypi/{name}/json", self.pypi_registry)
            .parse()
            .context("build pypi metadata uri")?;
        let doc = self.fetch_json(uri).await?;
        doc.get("info")
            .and_then(|info| info.get("version"))
            .and_then(|version| version.as_str())
            .map(SmolStr::from)
            .ok_or_else(|| BoxError::from(format!("pypi package {name} has no version info")))
    }

    /// Direct dependency names of an exact npm version.
    async fn npm_dependencies(
        &self,
        pkg: &PackageVersion,
        include_dev: bool,
    ) -> Result<Vec<SmolStr>, BoxError> {
        let uri: Uri = format!("{}/{}/{}", self.npm_registry, pkg.name(), pkg.version())
            .parse()
            .context("build npm version metadata uri")?;
        let doc = self.fetch_json(uri).await?;

        let mut deps = Vec::new();
        let mut push_all = |key: &str| {
            if let Some(map) = doc.get(key).and_then(|value| value.as_object()) {
                deps.extend(map.keys().map(SmolStr::from));
            }
        };
        push_all("dependencies");
        if include_dev {
            push_all("devDependencies");
        }
        Ok(deps)
    }

    /// Direct dependency names of an exact PyPI version, from
    /// `requires_dist`. Environment-marked extras are skipped.
    async fn pypi_dependencies(&self, pkg: &PackageVersion) -> Result<Vec<SmolStr>, BoxError> {
        let uri: Uri = format!(
            "{}/pypi/{}/{}/json",
            self.pypi_registry,
            pkg.name(),
            pkg.version()
        )
        .parse()
        .context("build pypi version metadata uri")?;
        let doc = self.fetch_json(uri).await?;

        let Some(requires) = doc
            .get("info")
            .and_then(|info| info.get("requires_dist"))
            .and_then(|value| value.as_array())
        else {
            return Ok(Vec::new());
        };

        Ok(requires
            .iter()
            .filter_map(|entry| entry.as_str())
            .filter(|entry| !entry.contains(';'))
            .filter_map(|entry| {
                let name_end = entry
                    .find(['<', '>', '~', '!', '=', '[', '(', ' '])
                    .unwrap_or(entry.len());
                let name = entry[..name_end].trim();
                (!name.is_empty()).then(|| SmolStr::from(name))
            })
            .collect())
    }

    async fn direct_dependencies(
        &self,
        pkg: &PackageVersion,
        include_dev: bool,
    ) -> Result<Vec<PackageVersion>, BoxError> {
        let names = match pkg.ecosystem() {
            Ecosystem::Npm => self.npm_dependencies(pkg, include_dev).await?,
            Ecosystem::PyPi => self.pypi_dependencies(pkg).await?,
            other => {
                tracing::debug!("no dependency walk for ecosystem {other}");
                return Ok(Vec::new());
            }
        };

        let mut deps = Vec::with_capacity(names.len());
        for name in names {
            let unresolved = PackageVersion::unversioned(pkg.ecosystem().clone(), name.as_str());
            let version = self.resolve_latest(&unresolved).await?;
            deps.push(unresolved.with_version(version.as_str()));
        }
        Ok(deps)
    }

    async fn resolve_latest(&self, pkg: &PackageVersion) -> Result<SmolStr, BoxError> {
        match pkg.ecosystem() {
            Ecosystem::Npm => self.npm_latest(pkg.name()).await,
            Ecosystem::PyPi => self.pypi_latest(pkg.name()).await,
            other => Err(BoxError::from(format!(
                "cannot resolve latest version for ecosystem {other}"
            ))),
        }
    }
}

impl<C> DependencyResolver for RegistryResolver<C>
where
    C: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    async fn latest_version(&self, pkg: PackageVersion) -> Result<SmolStr, BoxError> {
        self.resolve_latest(&pkg).await
    }

    async fn dependency_closure(
        &self,
        pkg: PackageVersion,
        max_depth: u32,
        include_dev: bool,
    ) -> Result<Vec<PackageVersion>, BoxError> {
        let mut closure = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(pkg.cache_key());

        let mut queue: VecDeque<(PackageVersion, u32)> = VecDeque::new();
        queue.push_back((pkg, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            // dev dependencies only matter at the root of the walk
            let with_dev = include_dev && depth == 0;
            let deps = match self.direct_dependencies(&current, with_dev).await {
                Ok(deps) => deps,
                Err(err) => {
                    // a missing or yanked dependency must not kill the walk
                    tracing::debug!(
                        package = %current,
                        "skipping dependency walk branch: {err}"
                    );
                    continue;
                }
            };
            for dep in deps {
                if seen.insert(dep.cache_key()) {
                    queue.push_back((dep.clone(), depth + 1));
                    closure.push(dep);
                }
            }
        }

        Ok(closure)
    }
}

/// Pulls install targets out of manifest files for manifest-driven installs.
pub trait ManifestExtractor: Send + Sync + 'static {
    fn extract(
        &self,
        workdir: &Path,
        files: Vec<PathBuf>,
        include_dev: bool,
    ) -> Result<Vec<PackageVersion>, BoxError>;
}

/// Extractor for `package.json` and `requirements.txt` manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestFileExtractor;

impl ManifestFileExtractor {
    fn extract_package_json(
        raw: &str,
        include_dev: bool,
    ) -> Result<Vec<PackageVersion>, BoxError> {
        let doc: serde_json::Value =
            serde_json::from_str(raw).context("decode package.json manifest")?;

        let mut targets = Vec::new();
        let mut push_all = |key: &str| {
            if let Some(map) = doc.get(key).and_then(|value| value.as_object()) {
                for (name, range) in map {
                    // exact pins keep their version, ranges stay unresolved
                    let range = range.as_str().unwrap_or_default();
                    let version = if range.starts_with(|c: char| c.is_ascii_digit()) {
                        range
                    } else {
                        ""
                    };
                    targets.push(PackageVersion::new(Ecosystem::Npm, name, version));
                }
            }
        };
        push_all("dependencies");
        if include_dev {
            push_all("devDependencies");
        }
        Ok(targets)
    }

    fn extract_requirements_txt(raw: &str) -> Vec<PackageVersion> {
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
            .filter_map(|line| {
                let (name, version) = match line.split_once("==") {
                    Some((name, version)) => {
                        // drop extras from the name and trailing
                        // markers/comments from the pin
                        let name = name.split('[').next().unwrap_or_default().trim();
                        let version = version
                            .split([';', '#', ' '])
                            .next()
                            .unwrap_or_default()
                            .trim();
                        (name, version)
                    }
                    None => {
                        let name_end = line
                            .find(['<', '>', '~', '!', '=', '[', ';', ' '])
                            .unwrap_or(line.len());
                        (line[..name_end].trim(), "")
                    }
                };
                (!name.is_empty()).then(|| PackageVersion::new(Ecosystem::PyPi, name, version))
            })
            .collect()
    }
}

impl ManifestExtractor for ManifestFileExtractor {
    fn extract(
        &self,
        workdir: &Path,
        files: Vec<PathBuf>,
        include_dev: bool,
    ) -> Result<Vec<PackageVersion>, BoxError> {
        let mut targets = Vec::new();
        for file in files {
            let path = if file.is_absolute() {
                file
            } else {
                workdir.join(file)
            };
            let raw = std::fs::read_to_string(&path)
                .context("read manifest file")
                .map_err(BoxError::from)?;

            match path.file_name().and_then(|name| name.to_str()) {
                Some("package.json") => {
                    targets.extend(Self::extract_package_json(&raw, include_dev)?);
                }
                _ => {
                    targets.extend(Self::extract_requirements_txt(&raw));
                }
            }
        }
        Ok(targets)
    }
}
