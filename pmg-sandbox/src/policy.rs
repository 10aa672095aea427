use serde::{Deserialize, Serialize};

use crate::SandboxError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemRules {
    pub allow_read: Vec<String>,
    pub allow_write: Vec<String>,
    pub deny_read: Vec<String>,
    pub deny_write: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRules {
    /// `host:port` patterns, `*` wildcards allowed on either side.
    pub allow_outbound: Vec<String>,
    pub deny_outbound: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessRules {
    pub allow_exec: Vec<String>,
    pub deny_exec: Vec<String>,
}

/// A declarative sandbox policy as loaded from YAML.
///
/// Path patterns may use the variables `${HOME}`, `${CWD}` and `${TMPDIR}`
/// plus glob syntax (`*`, `?`, `[…]`, `**`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub name: String,
    pub description: String,
    /// Name of the parent policy; cleared by inheritance resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherits: Option<String>,
    pub package_managers: Vec<String>,
    pub filesystem: FilesystemRules,
    pub network: NetworkRules,
    pub process: ProcessRules,
    pub allow_git_config: bool,
    pub allow_pty: bool,
}

impl SandboxPolicy {
    pub fn from_yaml(raw: &str) -> Result<Self, SandboxError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Checks that hold before inheritance resolution.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.name.trim().is_empty() {
            return Err(SandboxError::InvalidPolicy {
                name: self.name.clone(),
                message: "policy name must not be empty".to_owned(),
            });
        }
        if self.package_managers.is_empty() {
            return Err(SandboxError::InvalidPolicy {
                name: self.name.clone(),
                message: "policy must name at least one package manager".to_owned(),
            });
        }
        Ok(())
    }

    /// Checks that hold after inheritance resolution: no dangling `inherits`
    /// and at least one non-empty rule list.
    pub fn validate_resolved(&self) -> Result<(), SandboxError> {
        self.validate()?;
        if self.inherits.is_some() {
            return Err(SandboxError::InvalidPolicy {
                name: self.name.clone(),
                message: "policy still carries unresolved inheritance".to_owned(),
            });
        }
        if self.rule_lists().iter().all(|list| list.is_empty()) {
            return Err(SandboxError::InvalidPolicy {
                name: self.name.clone(),
                message: "resolved policy carries no rules at all".to_owned(),
            });
        }
        Ok(())
    }

    fn rule_lists(&self) -> [&Vec<String>; 8] {
        [
            &self.filesystem.allow_read,
            &self.filesystem.allow_write,
            &self.filesystem.deny_read,
            &self.filesystem.deny_write,
            &self.network.allow_outbound,
            &self.network.deny_outbound,
            &self.process.allow_exec,
            &self.process.deny_exec,
        ]
    }

    /// Merge this child policy with its (already resolved) parent.
    ///
    /// Rule lists union, parent entries first, duplicate child entries
    /// dropped. The package-manager list and booleans are replaced by the
    /// child; the `inherits` marker is cleared on the result.
    pub fn merged_with_parent(&self, parent: &SandboxPolicy) -> SandboxPolicy {
        SandboxPolicy {
            name: self.name.clone(),
            description: self.description.clone(),
            inherits: None,
            package_managers: self.package_managers.clone(),
            filesystem: FilesystemRules {
                allow_read: union(&parent.filesystem.allow_read, &self.filesystem.allow_read),
                allow_write: union(&parent.filesystem.allow_write, &self.filesystem.allow_write),
                deny_read: union(&parent.filesystem.deny_read, &self.filesystem.deny_read),
                deny_write: union(&parent.filesystem.deny_write, &self.filesystem.deny_write),
            },
            network: NetworkRules {
                allow_outbound: union(&parent.network.allow_outbound, &self.network.allow_outbound),
                deny_outbound: union(&parent.network.deny_outbound, &self.network.deny_outbound),
            },
            process: ProcessRules {
                allow_exec: union(&parent.process.allow_exec, &self.process.allow_exec),
                deny_exec: union(&parent.process.deny_exec, &self.process.deny_exec),
            },
            allow_git_config: self.allow_git_config,
            allow_pty: self.allow_pty,
        }
    }

    pub fn applies_to(&self, package_manager: &str) -> bool {
        self.package_managers
            .iter()
            .any(|pm| pm == package_manager)
    }
}

fn union(parent: &[String], child: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = parent.to_vec();
    for entry in child {
        if !merged.contains(entry) {
            merged.push(entry.clone());
        }
    }
    merged
}

/// A policy whose inheritance chain has been resolved and validated;
/// the only form translators accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy(SandboxPolicy);

impl ResolvedPolicy {
    pub(crate) fn new(policy: SandboxPolicy) -> Result<Self, SandboxError> {
        policy.validate_resolved()?;
        Ok(Self(policy))
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.0
    }
}

impl std::ops::Deref for ResolvedPolicy {
    type Target = SandboxPolicy;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> SandboxPolicy {
        SandboxPolicy {
            name: "base".to_owned(),
            package_managers: vec!["npm".to_owned()],
            filesystem: FilesystemRules {
                allow_read: vec!["/usr".to_owned(), "/bin".to_owned()],
                deny_write: vec!["${HOME}/.ssh".to_owned()],
                ..Default::default()
            },
            allow_pty: true,
            ..Default::default()
        }
    }

    fn child() -> SandboxPolicy {
        SandboxPolicy {
            name: "node-install".to_owned(),
            inherits: Some("base".to_owned()),
            package_managers: vec!["npm".to_owned(), "pnpm".to_owned()],
            filesystem: FilesystemRules {
                allow_read: vec!["/usr".to_owned(), "${CWD}".to_owned()],
                allow_write: vec!["${CWD}/node_modules/**".to_owned()],
                ..Default::default()
            },
            allow_pty: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_unions_lists_parent_first() {
        let merged = child().merged_with_parent(&parent());

        assert_eq!(merged.name, "node-install");
        assert!(merged.inherits.is_none());
        // parent-first order, duplicate "/usr" collapsed
        assert_eq!(
            merged.filesystem.allow_read,
            vec!["/usr", "/bin", "${CWD}"]
        );
        assert_eq!(merged.filesystem.allow_write, vec!["${CWD}/node_modules/**"]);
        assert_eq!(merged.filesystem.deny_write, vec!["${HOME}/.ssh"]);
        // booleans and package managers come from the child
        assert!(!merged.allow_pty);
        assert_eq!(merged.package_managers, vec!["npm", "pnpm"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let parent = parent();
        let once = child().merged_with_parent(&parent);
        let twice = once.merged_with_parent(&parent);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_validate() {
        let mut policy = parent();
        policy.validate().unwrap();

        policy.name.clear();
        assert!(policy.validate().is_err());

        let mut policy = parent();
        policy.package_managers.clear();
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_resolved() {
        let merged = child().merged_with_parent(&parent());
        merged.validate_resolved().unwrap();

        // unresolved inheritance is rejected
        assert!(child().validate_resolved().is_err());

        // a policy with no rules at all is rejected
        let empty = SandboxPolicy {
            name: "empty".to_owned(),
            package_managers: vec!["npm".to_owned()],
            ..Default::default()
        };
        assert!(empty.validate_resolved().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let raw = r#"
name: node-install
description: npm installs with a writable project directory
inherits: base
package_managers: [npm, pnpm, yarn]
filesystem:
  allow_read: ["${CWD}"]
  allow_write: ["${CWD}/node_modules/**"]
network:
  allow_outbound: ["registry.npmjs.org:443"]
allow_git_config: false
allow_pty: true
"#;
        let policy = SandboxPolicy::from_yaml(raw).unwrap();
        assert_eq!(policy.name, "node-install");
        assert_eq!(policy.inherits.as_deref(), Some("base"));
        assert_eq!(policy.package_managers, vec!["npm", "pnpm", "yarn"]);
        assert_eq!(policy.network.allow_outbound, vec!["registry.npmjs.org:443"]);
        assert!(policy.allow_pty);
        assert!(policy.applies_to("npm"));
        assert!(!policy.applies_to("pip"));
    }
}
