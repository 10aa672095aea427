#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

//! Declarative sandbox policies and their platform translators.
//!
//! A [`SandboxPolicy`] describes what a wrapped package manager may read,
//! write, execute and reach over the network. After inheritance resolution
//! the policy is translated into either a macOS Seatbelt profile (consumed
//! by `/usr/bin/sandbox-exec`) or a Bubblewrap argv, rewriting the child
//! command in place.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

pub mod bwrap;
pub mod deny;
pub mod expand;
pub mod policy;
pub mod registry;
pub mod seatbelt;

pub use self::bwrap::BwrapTranslator;
pub use self::expand::ExpansionVars;
pub use self::policy::{ResolvedPolicy, SandboxPolicy};
pub use self::registry::PolicyRegistry;
pub use self::seatbelt::SeatbeltTranslator;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandboxing is not supported on this platform")]
    UnsupportedPlatform,
    #[error("sandbox binary not found: {0}")]
    MissingBinary(String),
    #[error("unknown sandbox profile: {0}")]
    UnknownProfile(String),
    #[error("sandbox profile inheritance cycle involving {0}")]
    InheritanceCycle(String),
    #[error("invalid sandbox policy {name}: {message}")]
    InvalidPolicy { name: String, message: String },
    #[error("failed to parse sandbox policy: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A child command as program plus argv, rewritten in place by translators
/// so the caller simply executes whatever ends up in here.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Replace the program and prepend arguments, keeping the original
    /// invocation as the trailing command line.
    pub fn rewrap(
        &mut self,
        new_program: impl Into<PathBuf>,
        leading_args: impl IntoIterator<Item = impl Into<OsString>>,
    ) {
        let original_program = std::mem::replace(&mut self.program, new_program.into());
        let original_args = std::mem::take(&mut self.args);

        self.args = leading_args.into_iter().map(Into::into).collect();
        self.args.push(original_program.into_os_string());
        self.args.extend(original_args);
    }
}

/// Marker returned by a translator: which policy was applied plus the
/// cleanup handle for any temp files backing it.
#[derive(Debug)]
pub struct SandboxHandle {
    policy_name: String,
    temp_profile: Option<PathBuf>,
    closed: bool,
}

impl SandboxHandle {
    fn new(policy_name: impl Into<String>, temp_profile: Option<PathBuf>) -> Self {
        Self {
            policy_name: policy_name.into(),
            temp_profile,
            closed: false,
        }
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    pub fn profile_path(&self) -> Option<&Path> {
        self.temp_profile.as_deref()
    }

    /// Release backing resources. Idempotent; also runs on drop, but callers
    /// wanting guaranteed release should schedule it themselves.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(path) = self.temp_profile.take()
            && let Err(err) = std::fs::remove_file(&path)
        {
            tracing::debug!("failed to remove sandbox profile {}: {err}", path.display());
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Translate a resolved policy onto a child command.
pub trait SandboxTranslator: Send + Sync {
    fn apply(
        &self,
        policy: &ResolvedPolicy,
        spec: &mut CommandSpec,
    ) -> Result<SandboxHandle, SandboxError>;
}

/// The translator for the current platform.
///
/// Windows (and anything else without a supported sandbox) yields an error;
/// callers log a warning and run unsandboxed.
pub fn platform_translator() -> Result<Box<dyn SandboxTranslator>, SandboxError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(SeatbeltTranslator::new()))
    }
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(BwrapTranslator::new()?))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(SandboxError::UnsupportedPlatform)
    }
}
