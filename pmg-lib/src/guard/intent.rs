use std::path::PathBuf;

use rama::utils::str::smol_str::SmolStr;

use pmg_sandbox::CommandSpec;

use crate::package::{Ecosystem, PackageVersion};

/// The package managers the guard knows how to front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Pip,
    Poetry,
    Uv,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Pip => "pip",
            PackageManager::Poetry => "poetry",
            PackageManager::Uv => "uv",
        }
    }

    pub fn ecosystem(&self) -> Ecosystem {
        match self {
            PackageManager::Npm | PackageManager::Yarn | PackageManager::Pnpm => Ecosystem::Npm,
            PackageManager::Pip | PackageManager::Poetry | PackageManager::Uv => Ecosystem::PyPi,
        }
    }

    pub fn from_program(program: &str) -> Option<Self> {
        let basename = program.rsplit(['/', '\\']).next().unwrap_or(program);
        let basename = basename.strip_suffix(".exe").unwrap_or(basename);
        Some(match basename {
            "npm" => PackageManager::Npm,
            "yarn" => PackageManager::Yarn,
            "pnpm" => PackageManager::Pnpm,
            "pip" | "pip3" => PackageManager::Pip,
            "poetry" => PackageManager::Poetry,
            "uv" => PackageManager::Uv,
            _ => return None,
        })
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

/// The parsed install intent of a wrapped package-manager invocation.
#[derive(Debug, Clone)]
pub struct InstallIntent {
    /// The verbatim command to hand off to the real package manager.
    pub command: CommandSpec,
    pub package_manager: PackageManager,
    /// Explicitly named install targets. Versions may be unresolved.
    pub targets: Vec<PackageVersion>,
    /// Manifest files referenced by the invocation.
    pub manifest_files: Vec<PathBuf>,
    /// True when the invocation installs from a manifest instead of naming
    /// packages (e.g. a bare `npm install`).
    pub is_manifest_install: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IntentError {
    #[error("no package manager command given")]
    Empty,
    #[error("unsupported package manager: {0}")]
    UnsupportedPackageManager(String),
}

/// Parse a wrapped package-manager argv into an install intent.
///
/// Non-install invocations (e.g. `npm run build`) yield an intent without
/// targets and without the manifest flag; the guard forwards those untouched.
pub fn parse_install_intent(argv: &[String]) -> Result<InstallIntent, IntentError> {
    let (program, args) = argv.split_first().ok_or(IntentError::Empty)?;
    let package_manager = PackageManager::from_program(program)
        .ok_or_else(|| IntentError::UnsupportedPackageManager(program.clone()))?;

    let command = CommandSpec::new(program, args.iter().cloned());

    let mut intent = InstallIntent {
        command,
        package_manager,
        targets: Vec::new(),
        manifest_files: Vec::new(),
        is_manifest_install: false,
    };

    match package_manager {
        PackageManager::Npm | PackageManager::Yarn | PackageManager::Pnpm => {
            parse_npm_like(&mut intent, package_manager, args);
        }
        PackageManager::Pip => parse_pip_like(&mut intent, args),
        PackageManager::Poetry => parse_poetry(&mut intent, args),
        PackageManager::Uv => parse_uv(&mut intent, args),
    }

    Ok(intent)
}

fn is_flag(arg: &str) -> bool {
    arg.starts_with('-')
}

fn parse_npm_like(intent: &mut InstallIntent, pm: PackageManager, args: &[String]) {
    let install_subcommands: &[&str] = match pm {
        PackageManager::Npm => &["install", "i", "add", "ci"],
        PackageManager::Yarn => &["add", "install"],
        PackageManager::Pnpm => &["add", "install", "i"],
        _ => &[],
    };

    let Some(sub_idx) = args
        .iter()
        .position(|arg| !is_flag(arg))
        .filter(|idx| install_subcommands.contains(&args[*idx].as_str()))
    else {
        return;
    };

    let specs: Vec<&str> = args[sub_idx + 1..]
        .iter()
        .map(String::as_str)
        .filter(|arg| !is_flag(arg))
        .collect();

    if specs.is_empty() {
        // bare `npm install`: targets come out of the manifest
        intent.is_manifest_install = true;
        intent.manifest_files.push(PathBuf::from("package.json"));
        return;
    }

    for spec in specs {
        if let Some((name, version)) = split_npm_spec(spec) {
            intent
                .targets
                .push(PackageVersion::new(Ecosystem::Npm, name, version));
        }
    }
}

/// Split `name[@version]`, aware that scoped names start with `@`.
fn split_npm_spec(spec: &str) -> Option<(SmolStr, SmolStr)> {
    // local paths and archive/url installs are not registry packages
    if spec.starts_with('.') || spec.starts_with('/') || spec.contains("://") {
        return None;
    }

    match spec.rsplit_once('@') {
        Some((name, version)) if !name.is_empty() => {
            Some((SmolStr::from(name), SmolStr::from(version)))
        }
        _ => Some((SmolStr::from(spec), SmolStr::default())),
    }
}

/// pip options that consume the next argument, so their value is not
/// mistaken for a package spec.
const PIP_VALUE_OPTIONS: &[&str] = &[
    "-r",
    "--requirement",
    "-c",
    "--constraint",
    "-i",
    "--index-url",
    "--extra-index-url",
    "-f",
    "--find-links",
    "--target",
    "--platform",
    "--python-version",
    "--implementation",
    "--abi",
    "--root",
    "--prefix",
    "--src",
    "--proxy",
];

fn parse_pip_like(intent: &mut InstallIntent, args: &[String]) {
    let Some(sub_idx) = args
        .iter()
        .position(|arg| !is_flag(arg))
        .filter(|idx| args[*idx] == "install")
    else {
        return;
    };

    let mut rest = args[sub_idx + 1..].iter().peekable();
    while let Some(arg) = rest.next() {
        if arg == "-r" || arg == "--requirement" {
            if let Some(file) = rest.next() {
                intent.is_manifest_install = true;
                intent.manifest_files.push(PathBuf::from(file));
            }
            continue;
        }
        if PIP_VALUE_OPTIONS.contains(&arg.as_str()) {
            rest.next();
            continue;
        }
        if is_flag(arg) {
            continue;
        }
        if let Some((name, version)) = split_python_spec(arg) {
            intent
                .targets
                .push(PackageVersion::new(Ecosystem::PyPi, name, version));
        }
    }
}

fn parse_poetry(intent: &mut InstallIntent, args: &[String]) {
    let Some(sub_idx) = args
        .iter()
        .position(|arg| !is_flag(arg))
        .filter(|idx| args[*idx] == "add")
    else {
        return;
    };

    for arg in args[sub_idx + 1..].iter().filter(|arg| !is_flag(arg)) {
        if let Some((name, version)) = split_python_spec(arg) {
            intent
                .targets
                .push(PackageVersion::new(Ecosystem::PyPi, name, version));
        }
    }
}

fn parse_uv(intent: &mut InstallIntent, args: &[String]) {
    match args.first().map(String::as_str) {
        Some("add") => parse_poetry_style_add(intent, &args[1..]),
        Some("pip") => parse_pip_like(intent, &args[1..]),
        _ => {}
    }
}

fn parse_poetry_style_add(intent: &mut InstallIntent, args: &[String]) {
    for arg in args.iter().filter(|arg| !is_flag(arg)) {
        if let Some((name, version)) = split_python_spec(arg) {
            intent
                .targets
                .push(PackageVersion::new(Ecosystem::PyPi, name, version));
        }
    }
}

/// Split a python requirement spec into name and (exact) version.
///
/// Only `==` pins and poetry's `name@version` bind a version; range
/// specifiers leave the version unresolved for the resolver to pick.
fn split_python_spec(spec: &str) -> Option<(SmolStr, SmolStr)> {
    if spec.starts_with('.') || spec.starts_with('/') || spec.contains("://") {
        return None;
    }

    // strip extras: name[extra1,extra2]
    let spec = match spec.split_once('[') {
        Some((name, rest)) => {
            let version_part = rest.split_once(']').map(|(_, tail)| tail).unwrap_or("");
            return split_python_spec(&format!("{name}{version_part}"));
        }
        None => spec,
    };

    if let Some((name, version)) = spec.split_once("==") {
        return Some((SmolStr::from(name.trim()), SmolStr::from(version.trim())));
    }
    if let Some((name, version)) = spec.split_once('@')
        && !name.is_empty()
    {
        // poetry range specs (@^1.2, @~1.2) leave the version unresolved
        let version = version.trim();
        let version = if version.starts_with(['^', '~', '<', '>', '*']) {
            ""
        } else {
            version.trim_start_matches('=')
        };
        return Some((SmolStr::from(name.trim()), SmolStr::from(version)));
    }

    // range specifiers: keep the name, drop the constraint
    let name_end = spec
        .find(['<', '>', '~', '!', '=', ';', ' '])
        .unwrap_or(spec.len());
    let name = spec[..name_end].trim();
    if name.is_empty() {
        return None;
    }
    Some((SmolStr::from(name), SmolStr::default()))
}
