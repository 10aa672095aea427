use std::collections::HashMap;

use rama::telemetry::tracing;
use tokio::process::Command;

use pmg_sandbox::{CommandSpec, SandboxHandle, platform_translator};

use super::GuardError;

/// Exit code reported when the child terminated without one (signal death on
/// unix maps to the conventional 128+N instead).
const FALLBACK_EXIT_CODE: i32 = 1;

/// Wrap the command in the platform sandbox if a policy is given.
///
/// Sandbox unavailability degrades: a warning is printed and the command runs
/// unsandboxed, per the error-handling contract.
pub(super) fn apply_sandbox(
    spec: &mut CommandSpec,
    policy: Option<&pmg_sandbox::ResolvedPolicy>,
) -> Option<SandboxHandle> {
    let policy = policy?;

    let translator = match platform_translator() {
        Ok(translator) => translator,
        Err(err) => {
            tracing::warn!("sandbox unavailable on this platform, running unsandboxed: {err}");
            return None;
        }
    };

    match translator.apply(policy, spec) {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!("failed to set up sandbox, running unsandboxed: {err}");
            None
        }
    }
}

/// Run the real package manager with inherited stdio and the caller's working
/// directory; the child's exit code passes through verbatim.
pub(super) async fn run_package_manager(
    spec: &CommandSpec,
    extra_env: &HashMap<String, String>,
) -> Result<i32, GuardError> {
    let mut command = Command::new(spec.program());
    command.args(spec.args());
    for (key, value) in extra_env {
        command.env(key, value);
    }

    tracing::debug!(program = %spec.program().display(), "executing package manager");

    let status = command.status().await.map_err(GuardError::Subprocess)?;

    Ok(exit_code_for(status))
}

#[cfg(target_family = "unix")]
fn exit_code_for(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(FALLBACK_EXIT_CODE)
}

#[cfg(not(target_family = "unix"))]
fn exit_code_for(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(FALLBACK_EXIT_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_code_passes_through() {
        let spec = CommandSpec::new("sh", ["-c".to_owned(), "exit 42".to_owned()]);
        let code = run_package_manager(&spec, &HashMap::new()).await.unwrap();
        assert_eq!(code, 42);
    }

    #[tokio::test]
    async fn test_zero_exit_code() {
        let spec = CommandSpec::new("true", Vec::<String>::new());
        let code = run_package_manager(&spec, &HashMap::new()).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_subprocess_error() {
        let spec = CommandSpec::new("/nonexistent/definitely-not-a-binary", Vec::<String>::new());
        let err = run_package_manager(&spec, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, GuardError::Subprocess(_)));
    }
}
