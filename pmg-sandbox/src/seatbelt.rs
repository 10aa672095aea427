use std::{
    fmt::Write as _,
    io::Write as _,
    path::PathBuf,
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    CommandSpec, SandboxError, SandboxHandle, SandboxTranslator,
    deny::mandatory_deny_patterns,
    expand::{ExpansionVars, contains_glob, expand_variables, glob_to_regex},
    policy::ResolvedPolicy,
};

/// Only `/usr/bin/sandbox-exec` is ever used, never a PATH lookup: a
/// tampered `/usr/bin` already means root access.
pub const SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

/// Per-process tag embedded in deny rules via `(with message ...)`.
///
/// Seatbelt violations surface in the unified system log; the tag makes the
/// entries of this process findable among everything else sandboxd reports.
pub fn violation_log_tag() -> &'static str {
    static TAG: OnceLock<String> = OnceLock::new();
    TAG.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seed = nanos ^ u128::from(std::process::id());
        format!("PMG_SBX_{seed:016x}")
    })
}

const BASE_PROFILE: &str = include_str!("seatbelt_base.sbpl");

/// Translates a resolved policy into a Seatbelt S-expression profile and
/// rewrites the child to run under `sandbox-exec`.
#[derive(Debug, Clone)]
pub struct SeatbeltTranslator {
    move_blocking: bool,
}

impl Default for SeatbeltTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl SeatbeltTranslator {
    pub fn new() -> Self {
        Self {
            move_blocking: true,
        }
    }

    pub fn with_move_blocking(mut self, move_blocking: bool) -> Self {
        self.move_blocking = move_blocking;
        self
    }
}

fn sb_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn path_filter(pattern: &str) -> String {
    if contains_glob(pattern) {
        format!("(regex #{})", sb_quote(&glob_to_regex(pattern)))
    } else {
        format!("(subpath {})", sb_quote(pattern))
    }
}

/// All ancestors of a path up to (excluding) the root.
fn ancestor_directories(path: &str) -> Vec<String> {
    let mut ancestors = Vec::new();
    let mut current = PathBuf::from(path);
    while let Some(parent) = current.parent().map(PathBuf::from) {
        let parent_str = parent.to_string_lossy().into_owned();
        if parent_str.is_empty() || parent_str == "/" {
            break;
        }
        ancestors.push(parent_str);
        current = parent;
    }
    ancestors
}

/// Static (non-glob) base directory of a pattern, for ancestor move rules.
fn static_base(pattern: &str) -> Option<String> {
    if !contains_glob(pattern) {
        return Some(pattern.to_owned());
    }
    let prefix: String = pattern
        .chars()
        .take_while(|c| !matches!(c, '*' | '?' | '['))
        .collect();
    let base = prefix.rsplit_once('/').map(|(dir, _)| dir.to_owned())?;
    (!base.is_empty() && base != "/").then_some(base)
}

/// Generate the full Seatbelt profile for a resolved policy.
pub fn generate_profile(
    policy: &ResolvedPolicy,
    vars: &ExpansionVars,
    move_blocking: bool,
) -> String {
    let tag = violation_log_tag();
    let mut profile = String::with_capacity(8 * 1024);

    profile.push_str("(version 1)\n");
    let _ = writeln!(profile, "; policy: {}", policy.name);
    profile.push_str("(deny default)\n\n");
    profile.push_str(BASE_PROFILE);
    profile.push('\n');

    let expand =
        |patterns: &[String]| -> Vec<String> {
            patterns
                .iter()
                .map(|pattern| expand_variables(pattern, vars))
                .collect()
        };

    let allow_read = expand(&policy.filesystem.allow_read);
    let allow_write = expand(&policy.filesystem.allow_write);
    let deny_read = expand(&policy.filesystem.deny_read);
    let mandatory = mandatory_deny_patterns(vars, policy.allow_git_config);
    let mut deny_write = expand(&policy.filesystem.deny_write);
    deny_write.extend(mandatory.iter().cloned());

    profile.push_str("; filesystem\n");
    for pattern in &allow_read {
        let _ = writeln!(profile, "(allow file-read* {})", path_filter(pattern));
    }
    for pattern in &allow_write {
        let _ = writeln!(
            profile,
            "(allow file-write* file-read* {})",
            path_filter(pattern)
        );
    }
    // denies come last so they defeat any overlapping allow; the mandatory
    // set also denies reads (credentials must stay unreadable on macOS)
    for pattern in &deny_read {
        let _ = writeln!(
            profile,
            "(deny file-read* {} (with message {}))",
            path_filter(pattern),
            sb_quote(tag)
        );
    }
    for pattern in &deny_write {
        let _ = writeln!(
            profile,
            "(deny file-write* {} (with message {}))",
            path_filter(pattern),
            sb_quote(tag)
        );
    }
    for pattern in &mandatory {
        let _ = writeln!(
            profile,
            "(deny file-read* {} (with message {}))",
            path_filter(pattern),
            sb_quote(tag)
        );
    }

    if move_blocking {
        profile.push_str("\n; move blocking: renames must not smuggle protected paths\n");
        for pattern in deny_write.iter().chain(deny_read.iter()) {
            let _ = writeln!(
                profile,
                "(deny file-write-unlink {} (with message {}))",
                path_filter(pattern),
                sb_quote(tag)
            );
            if let Some(base) = static_base(pattern) {
                for ancestor in ancestor_directories(&base) {
                    let _ = writeln!(
                        profile,
                        "(deny file-write-unlink (literal {}) (with message {}))",
                        sb_quote(&ancestor),
                        sb_quote(tag)
                    );
                }
            }
        }
    }

    profile.push_str("\n; network\n");
    // coarse: any allowlist entry opens outbound; the per-host firewall is
    // the proxy's job, not seatbelt's
    if policy.network.allow_outbound.is_empty() {
        let _ = writeln!(
            profile,
            "(deny network-outbound (with message {}))",
            sb_quote(tag)
        );
    } else {
        profile.push_str("(allow network-outbound)\n");
        profile.push_str("(allow system-socket)\n");
    }

    profile.push_str("\n; process\n");
    for pattern in expand(&policy.process.allow_exec) {
        let _ = writeln!(profile, "(allow process-exec* {})", path_filter(&pattern));
    }
    for pattern in expand(&policy.process.deny_exec) {
        let _ = writeln!(
            profile,
            "(deny process-exec* {} (with message {}))",
            path_filter(&pattern),
            sb_quote(tag)
        );
    }

    if policy.allow_pty {
        profile.push_str("\n; pty\n");
        profile.push_str("(allow file-read* file-write* (literal \"/dev/ptmx\"))\n");
        profile.push_str("(allow file-read* file-write* (regex #\"^/dev/ttys[0-9]+$\"))\n");
        profile.push_str("(allow file-ioctl (literal \"/dev/ptmx\"))\n");
    }

    profile
}

impl SandboxTranslator for SeatbeltTranslator {
    fn apply(
        &self,
        policy: &ResolvedPolicy,
        spec: &mut CommandSpec,
    ) -> Result<SandboxHandle, SandboxError> {
        let vars = ExpansionVars::from_env();
        let profile = generate_profile(policy, &vars, self.move_blocking);

        let mut file = tempfile::Builder::new()
            .prefix("pmg-sandbox-")
            .suffix(".sb")
            .tempfile()?;
        file.write_all(profile.as_bytes())?;
        let (_, path) = file.keep().map_err(|err| SandboxError::Io(err.error))?;

        tracing::debug!(
            profile = %path.display(),
            policy = %policy.name,
            "wrote seatbelt profile"
        );

        spec.rewrap(
            SEATBELT_EXECUTABLE,
            ["-f".to_owned(), path.to_string_lossy().into_owned()],
        );

        Ok(SandboxHandle::new(policy.name.clone(), Some(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FilesystemRules, NetworkRules, ProcessRules, SandboxPolicy};
    use std::path::Path;

    fn vars() -> ExpansionVars {
        ExpansionVars {
            home: PathBuf::from("/home/user"),
            cwd: PathBuf::from("/work/project"),
            tmpdir: PathBuf::from("/tmp"),
        }
    }

    fn policy(network_allowed: bool, allow_pty: bool) -> ResolvedPolicy {
        ResolvedPolicy::new(SandboxPolicy {
            name: "test-policy".to_owned(),
            package_managers: vec!["npm".to_owned()],
            filesystem: FilesystemRules {
                allow_read: vec!["/usr".to_owned(), "${CWD}".to_owned()],
                allow_write: vec!["${CWD}/node_modules/**".to_owned()],
                deny_read: vec!["${HOME}/secrets".to_owned()],
                deny_write: vec!["${HOME}/.config/**".to_owned()],
            },
            network: NetworkRules {
                allow_outbound: if network_allowed {
                    vec!["registry.npmjs.org:443".to_owned()]
                } else {
                    Vec::new()
                },
                deny_outbound: Vec::new(),
            },
            process: ProcessRules {
                allow_exec: vec!["/usr/bin".to_owned()],
                deny_exec: vec!["/usr/bin/curl".to_owned()],
            },
            allow_git_config: false,
            allow_pty,
        })
        .unwrap()
    }

    #[test]
    fn test_profile_shape() {
        let profile = generate_profile(&policy(true, false), &vars(), true);

        assert!(profile.starts_with("(version 1)\n"));
        assert!(profile.contains("(deny default)"));
        // baseline corpus made it in
        assert!(profile.contains("(allow process-fork)"));
        assert!(profile.contains("com.apple.SecurityServer"));
        // literal dirs use subpath, globs use regex
        assert!(profile.contains(r#"(allow file-read* (subpath "/usr"))"#));
        assert!(profile.contains(r#"(allow file-read* (subpath "/work/project"))"#));
        assert!(
            profile.contains(r#"(regex #"^/work/project/node_modules(.*/)?"#)
                || profile.contains(r#"(regex #"^/work/project/node_modules/.*$")"#),
            "glob write rule must be a regex: {profile}"
        );
        // denies carry the violation tag
        assert!(profile.contains(r#"(deny file-read* (subpath "/home/user/secrets") (with message"#));
        assert!(profile.contains(violation_log_tag()));
        // network coarse-allow
        assert!(profile.contains("(allow network-outbound)"));
        // process rules
        assert!(profile.contains(r#"(allow process-exec* (subpath "/usr/bin"))"#));
        assert!(profile.contains(r#"(deny process-exec* (subpath "/usr/bin/curl")"#));
    }

    #[test]
    fn test_mandatory_denies_are_always_present() {
        let profile = generate_profile(&policy(true, false), &vars(), false);
        for needle in [
            "/home/user/.ssh",
            "/home/user/.npmrc",
            "/work/project/.env",
            ".git/hooks",
        ] {
            assert!(profile.contains(needle), "missing mandatory deny: {needle}");
        }
        // reads of credentials are denied too on macOS
        assert!(profile.contains(r#"(deny file-read* (subpath "/home/user/.ssh")"#));
    }

    #[test]
    fn test_network_deny_when_no_allowlist() {
        let profile = generate_profile(&policy(false, false), &vars(), false);
        assert!(profile.contains("(deny network-outbound"));
        assert!(!profile.contains("(allow network-outbound)"));
    }

    #[test]
    fn test_move_blocking_covers_ancestors() {
        let profile = generate_profile(&policy(true, false), &vars(), true);
        assert!(profile.contains("file-write-unlink"));
        // ancestor of ${HOME}/.config/** move-blocked as literal
        assert!(profile.contains(r#"(deny file-write-unlink (literal "/home/user")"#));

        let without = generate_profile(&policy(true, false), &vars(), false);
        assert!(!without.contains("file-write-unlink"));
    }

    #[test]
    fn test_pty_rules_are_optional() {
        let with_pty = generate_profile(&policy(true, true), &vars(), false);
        assert!(with_pty.contains("/dev/ptmx"));
        assert!(with_pty.contains("/dev/ttys"));

        let without_pty = generate_profile(&policy(true, false), &vars(), false);
        assert!(!without_pty.contains("/dev/ptmx"));
    }

    #[test]
    fn test_apply_rewrites_command_and_cleans_up() {
        let mut spec = CommandSpec::new("npm", ["install".to_owned()]);
        let translator = SeatbeltTranslator::new();
        let mut handle = translator.apply(&policy(true, false), &mut spec).unwrap();

        assert_eq!(spec.program(), Path::new(SEATBELT_EXECUTABLE));
        let args: Vec<String> = spec
            .args()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-f");
        assert!(args[1].ends_with(".sb"));
        assert_eq!(&args[2..], ["npm", "install"]);

        let profile_path = PathBuf::from(&args[1]);
        assert!(profile_path.exists());
        handle.close();
        assert!(!profile_path.exists(), "cleanup must remove the profile");
    }
}
