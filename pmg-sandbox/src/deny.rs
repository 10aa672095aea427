use std::path::PathBuf;

use crate::expand::ExpansionVars;

/// Credential and configuration files the sandbox always denies writes to
/// (and, on macOS, reads of). Materialized against both the working
/// directory and the home directory.
pub const MANDATORY_DENY_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    ".aws",
    ".gcloud",
    ".azure",
    ".ssh",
    ".gnupg",
    ".kube",
    ".docker/config.json",
    ".pypirc",
    ".npmrc",
    ".netrc",
    ".pgpass",
];

/// Credential directories hidden wholesale (bwrap mounts tmpfs over them).
pub const CREDENTIAL_DIRECTORIES: &[&str] =
    &[".ssh", ".gnupg", ".aws", ".gcloud", ".azure", ".kube", ".docker"];

const GIT_HOOKS_PATTERN: &str = ".git/hooks";
const GIT_CONFIG_PATTERN: &str = ".git/config";

/// The built-in deny-write pattern set for a policy.
///
/// Each base name lands as `<cwd>/<name>` and `<home>/<name>`, plus a
/// `**/<name>` glob under the working directory so nested projects are
/// covered. `.git/hooks` denies recursively; `.git/config` joins unless the
/// policy allows git config writes.
pub fn mandatory_deny_patterns(vars: &ExpansionVars, allow_git_config: bool) -> Vec<String> {
    let cwd = vars.cwd.to_string_lossy();
    let home = vars.home.to_string_lossy();

    let mut patterns = Vec::new();
    for name in MANDATORY_DENY_PATTERNS {
        patterns.push(format!("{cwd}/{name}"));
        patterns.push(format!("{home}/{name}"));
        patterns.push(format!("{cwd}/**/{name}"));
    }

    patterns.push(format!("{cwd}/{GIT_HOOKS_PATTERN}/**"));
    patterns.push(format!("{cwd}/**/{GIT_HOOKS_PATTERN}/**"));

    if !allow_git_config {
        patterns.push(format!("{cwd}/{GIT_CONFIG_PATTERN}"));
        patterns.push(format!("{cwd}/**/{GIT_CONFIG_PATTERN}"));
    }

    patterns
}

/// Absolute credential directories under the user's home.
pub fn credential_directories(vars: &ExpansionVars) -> Vec<PathBuf> {
    CREDENTIAL_DIRECTORIES
        .iter()
        .map(|name| vars.home.join(name))
        .collect()
}
