use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{
    CommandSpec, SandboxError, SandboxHandle, SandboxTranslator,
    deny::credential_directories,
    expand::{ExpansionVars, GlobError, GlobExpansion, GlobLimits, contains_glob, expand_glob,
        expand_variables, longest_non_glob_ancestor},
    policy::ResolvedPolicy,
};

/// System prefixes every child needs read-only to run at all.
const ESSENTIAL_RO_PATHS: &[&str] = &[
    "/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc", "/opt", "/var/lib", "/sys",
];

const ESSENTIAL_DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
];

/// Translates a resolved policy into a `bwrap` argv and rewrites the child
/// command to run inside it.
#[derive(Debug, Clone)]
pub struct BwrapTranslator {
    binary: PathBuf,
    limits: GlobLimits,
    default_network_isolation: bool,
}

impl BwrapTranslator {
    /// Locate `bwrap` on `$PATH`.
    pub fn new() -> Result<Self, SandboxError> {
        let binary = find_on_path("bwrap")
            .ok_or_else(|| SandboxError::MissingBinary("bwrap".to_owned()))?;
        Ok(Self::with_binary(binary))
    }

    /// Use an explicit bwrap binary (tests, vendored installs).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            limits: GlobLimits::default(),
            default_network_isolation: true,
        }
    }

    pub fn with_glob_limits(mut self, limits: GlobLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_default_network_isolation(mut self, isolate: bool) -> Self {
        self.default_network_isolation = isolate;
        self
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}

struct ArgvBuilder {
    args: Vec<OsString>,
}

impl ArgvBuilder {
    fn new() -> Self {
        Self { args: Vec::new() }
    }

    fn push(&mut self, arg: impl Into<OsString>) {
        self.args.push(arg.into());
    }

    fn flag(&mut self, flag: &str) {
        self.push(flag);
    }

    fn bind(&mut self, kind: &str, path: &Path) {
        self.push(kind);
        self.push(path);
        self.push(path);
    }

    fn bind_to(&mut self, kind: &str, source: &Path, dest: &Path) {
        self.push(kind);
        self.push(source);
        self.push(dest);
    }
}

/// Resolve a policy path pattern to the concrete paths to bind.
///
/// Write patterns that match nothing on disk degrade to the nearest existing
/// ancestor so the child can create the path itself.
fn resolve_bind_targets(
    pattern: &str,
    limits: GlobLimits,
    writable_fallback: bool,
) -> Vec<PathBuf> {
    if !contains_glob(pattern) {
        let path = PathBuf::from(pattern);
        if path.exists() {
            return vec![path];
        }
        if writable_fallback {
            return nearest_existing_ancestor(&path).into_iter().collect();
        }
        return Vec::new();
    }

    match expand_glob(pattern, limits) {
        Ok(GlobExpansion::Literal(path)) if path.exists() => vec![path],
        Ok(GlobExpansion::Literal(path)) if writable_fallback => {
            nearest_existing_ancestor(&path).into_iter().collect()
        }
        Ok(GlobExpansion::Literal(_)) => Vec::new(),
        Ok(GlobExpansion::Paths(paths)) if paths.is_empty() && writable_fallback => {
            // nothing matched yet: bind the closest real ancestor writable
            // so e.g. `mkdir node_modules` succeeds inside the sandbox
            nearest_existing_ancestor(&longest_non_glob_ancestor(pattern))
                .into_iter()
                .collect()
        }
        Ok(GlobExpansion::Paths(paths)) => paths,
        Ok(GlobExpansion::Ancestor(ancestor)) => vec![ancestor],
        Err(GlobError::EmptyBase) => {
            tracing::warn!("refusing to expand rootless glob pattern {pattern}");
            Vec::new()
        }
    }
}

/// Build the full bwrap argument vector for a resolved policy.
pub fn build_args(
    policy: &ResolvedPolicy,
    vars: &ExpansionVars,
    limits: GlobLimits,
    default_network_isolation: bool,
) -> Vec<OsString> {
    let mut argv = ArgvBuilder::new();
    let dev_null = Path::new("/dev/null");

    // phase 1: essential system binds, filtered to what exists
    for path in ESSENTIAL_RO_PATHS {
        let path = Path::new(path);
        if path.exists() {
            argv.bind("--ro-bind-try", path);
        }
    }
    for device in ESSENTIAL_DEVICES {
        let device = Path::new(device);
        if device.exists() {
            argv.bind("--dev-bind-try", device);
        }
    }
    argv.push("--proc");
    argv.push("/proc");

    // phase 2: namespace isolation
    let block_network = (policy.network.allow_outbound.is_empty() && default_network_isolation)
        || policy
            .network
            .deny_outbound
            .iter()
            .any(|pattern| pattern == "*:*");
    if block_network {
        argv.flag("--unshare-net");
    }
    argv.flag("--unshare-pid");
    argv.flag("--unshare-ipc");
    argv.flag("--new-session");
    argv.flag("--die-with-parent");

    // phase 3: policy filesystem; writes after reads so rw mounts win
    for pattern in &policy.filesystem.allow_read {
        let pattern = expand_variables(pattern, vars);
        for path in resolve_bind_targets(&pattern, limits, false) {
            argv.bind("--ro-bind-try", &path);
        }
    }
    for pattern in &policy.filesystem.allow_write {
        let pattern = expand_variables(pattern, vars);
        for path in resolve_bind_targets(&pattern, limits, true) {
            argv.bind("--bind", &path);
        }
    }
    for pattern in &policy.filesystem.deny_write {
        let pattern = expand_variables(pattern, vars);
        // nonexistent deny targets are already covered by default-deny
        for path in resolve_bind_targets(&pattern, limits, false) {
            if path.is_dir() {
                argv.bind("--ro-bind-try", &path);
            } else {
                argv.bind_to("--bind", dev_null, &path);
            }
        }
    }

    // phase 4: credential directories disappear wholesale
    for dir in credential_directories(vars) {
        if dir.exists() {
            argv.push("--tmpfs");
            argv.push(dir);
        }
    }

    // phase 5: denied executables read as empty files
    for pattern in &policy.process.deny_exec {
        let pattern = expand_variables(pattern, vars);
        for path in resolve_bind_targets(&pattern, limits, false) {
            argv.bind_to("--bind", dev_null, &path);
        }
    }

    // phase 6: optional pty plumbing
    if policy.allow_pty {
        argv.bind("--dev-bind-try", Path::new("/dev/pts"));
        argv.bind("--dev-bind-try", Path::new("/dev/ptmx"));
    }

    // phase 7: tmpdir is always writable
    argv.bind("--bind", &vars.tmpdir);

    argv.args
}

impl SandboxTranslator for BwrapTranslator {
    fn apply(
        &self,
        policy: &ResolvedPolicy,
        spec: &mut CommandSpec,
    ) -> Result<SandboxHandle, SandboxError> {
        let vars = ExpansionVars::from_env();
        let mut args = build_args(policy, &vars, self.limits, self.default_network_isolation);
        args.push(OsString::from("--"));

        tracing::debug!(
            policy = %policy.name,
            args = args.len(),
            "wrapping command in bwrap"
        );

        spec.rewrap(self.binary.clone(), args);

        Ok(SandboxHandle::new(policy.name.clone(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FilesystemRules, NetworkRules, ProcessRules, SandboxPolicy};

    fn vars_in(dir: &Path) -> ExpansionVars {
        ExpansionVars {
            home: dir.join("home"),
            cwd: dir.join("project"),
            tmpdir: dir.join("tmp"),
        }
    }

    fn policy(filesystem: FilesystemRules, network: NetworkRules) -> ResolvedPolicy {
        ResolvedPolicy::new(SandboxPolicy {
            name: "test-policy".to_owned(),
            package_managers: vec!["npm".to_owned()],
            filesystem,
            network,
            process: ProcessRules::default(),
            ..Default::default()
        })
        .unwrap()
    }

    fn args_to_strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn has_triple(args: &[String], kind: &str, source: &str, dest: &str) -> bool {
        args.windows(3)
            .any(|w| w[0] == kind && w[1] == source && w[2] == dest)
    }

    #[test]
    fn test_baseline_argv_shape() {
        let dir = tempfile::tempdir().unwrap();
        let vars = vars_in(dir.path());
        std::fs::create_dir_all(&vars.cwd).unwrap();
        std::fs::create_dir_all(&vars.tmpdir).unwrap();

        let policy = policy(
            FilesystemRules {
                allow_read: vec!["${CWD}".to_owned()],
                ..Default::default()
            },
            NetworkRules::default(),
        );
        let args = args_to_strings(&build_args(&policy, &vars, GlobLimits::default(), true));

        // essential binds and isolation flags
        assert!(has_triple(&args, "--ro-bind-try", "/usr", "/usr"));
        assert!(args.windows(2).any(|w| w[0] == "--proc" && w[1] == "/proc"));
        for flag in [
            "--unshare-net",
            "--unshare-pid",
            "--unshare-ipc",
            "--new-session",
            "--die-with-parent",
        ] {
            assert!(args.contains(&flag.to_owned()), "missing flag {flag}");
        }

        let cwd = vars.cwd.to_string_lossy();
        assert!(has_triple(&args, "--ro-bind-try", &cwd, &cwd));

        let tmp = vars.tmpdir.to_string_lossy();
        assert!(has_triple(&args, "--bind", &tmp, &tmp));
    }

    #[test]
    fn test_network_allowlist_keeps_network() {
        let dir = tempfile::tempdir().unwrap();
        let vars = vars_in(dir.path());
        std::fs::create_dir_all(&vars.tmpdir).unwrap();

        let policy = policy(
            FilesystemRules {
                allow_read: vec!["/usr".to_owned()],
                ..Default::default()
            },
            NetworkRules {
                allow_outbound: vec!["registry.npmjs.org:443".to_owned()],
                deny_outbound: Vec::new(),
            },
        );
        let args = args_to_strings(&build_args(&policy, &vars, GlobLimits::default(), true));
        assert!(!args.contains(&"--unshare-net".to_owned()));

        // a wildcard deny overrides the allowlist
        let policy = self::policy(
            FilesystemRules {
                allow_read: vec!["/usr".to_owned()],
                ..Default::default()
            },
            NetworkRules {
                allow_outbound: vec!["registry.npmjs.org:443".to_owned()],
                deny_outbound: vec!["*:*".to_owned()],
            },
        );
        let args = args_to_strings(&build_args(&policy, &vars, GlobLimits::default(), true));
        assert!(args.contains(&"--unshare-net".to_owned()));
    }

    #[test]
    fn test_absent_write_path_binds_nearest_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let vars = vars_in(dir.path());
        std::fs::create_dir_all(&vars.cwd).unwrap();
        std::fs::create_dir_all(&vars.tmpdir).unwrap();
        // node_modules does not exist yet

        let policy = policy(
            FilesystemRules {
                allow_read: vec!["${CWD}".to_owned()],
                allow_write: vec!["${CWD}/node_modules/**".to_owned()],
                ..Default::default()
            },
            NetworkRules::default(),
        );
        let args = args_to_strings(&build_args(&policy, &vars, GlobLimits::default(), true));

        // the project dir itself gets bound writable so the child can
        // create node_modules
        let cwd = vars.cwd.to_string_lossy();
        assert!(
            has_triple(&args, "--bind", &cwd, &cwd),
            "expected writable cwd bind in {args:?}"
        );
    }

    #[test]
    fn test_deny_write_masks_files_with_dev_null() {
        let dir = tempfile::tempdir().unwrap();
        let vars = vars_in(dir.path());
        std::fs::create_dir_all(&vars.cwd).unwrap();
        std::fs::create_dir_all(&vars.tmpdir).unwrap();
        let secret = vars.cwd.join(".npmrc");
        std::fs::write(&secret, "//registry.npmjs.org/:_authToken=...").unwrap();

        let policy = policy(
            FilesystemRules {
                allow_read: vec!["${CWD}".to_owned()],
                deny_write: vec!["${CWD}/.npmrc".to_owned()],
                ..Default::default()
            },
            NetworkRules::default(),
        );
        let args = args_to_strings(&build_args(&policy, &vars, GlobLimits::default(), true));
        assert!(has_triple(
            &args,
            "--bind",
            "/dev/null",
            &secret.to_string_lossy()
        ));
    }

    #[test]
    fn test_credential_directories_become_tmpfs() {
        let dir = tempfile::tempdir().unwrap();
        let vars = vars_in(dir.path());
        std::fs::create_dir_all(vars.home.join(".ssh")).unwrap();
        std::fs::create_dir_all(&vars.tmpdir).unwrap();

        let policy = policy(
            FilesystemRules {
                allow_read: vec!["/usr".to_owned()],
                ..Default::default()
            },
            NetworkRules::default(),
        );
        let args = args_to_strings(&build_args(&policy, &vars, GlobLimits::default(), true));

        let ssh = vars.home.join(".ssh");
        assert!(
            args.windows(2)
                .any(|w| w[0] == "--tmpfs" && w[1] == ssh.to_string_lossy()),
            "expected tmpfs over {ssh:?}"
        );
    }

    #[test]
    fn test_apply_rewraps_command() {
        let policy = policy(
            FilesystemRules {
                allow_read: vec!["/usr".to_owned()],
                ..Default::default()
            },
            NetworkRules::default(),
        );

        let translator = BwrapTranslator::with_binary("/usr/bin/bwrap");
        let mut spec = CommandSpec::new("npm", ["install".to_owned(), "left-pad".to_owned()]);
        let handle = translator.apply(&policy, &mut spec).unwrap();

        assert_eq!(spec.program(), Path::new("/usr/bin/bwrap"));
        let args = args_to_strings(spec.args());
        let separator = args.iter().position(|arg| arg == "--").unwrap();
        assert_eq!(&args[separator + 1..], ["npm", "install", "left-pad"]);
        assert!(handle.profile_path().is_none());
    }
}
