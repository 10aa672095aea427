use rama::error::BoxError;
use tokio::io::{AsyncBufReadExt as _, BufReader};

use pmg_lib::analysis::{AnalysisResult, ConfirmationPrompt};

/// Line-based terminal confirmation: the question goes to stderr (stdout
/// belongs to the wrapped tool), the answer is read from stdin. Anything
/// other than an explicit yes declines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl ConfirmationPrompt for TerminalPrompt {
    async fn confirm(&self, result: &AnalysisResult) -> Result<bool, BoxError> {
        eprintln!();
        eprintln!("Suspicious package detected: {}", result.package);
        if !result.summary.is_empty() {
            eprintln!("  Reason:    {}", result.summary);
        }
        if !result.reference_url.is_empty() {
            eprintln!("  Reference: {}", result.reference_url);
        }
        eprint!("Install anyway? [y/N] ");

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            // stdin closed (non-interactive invocation): decline
            return Ok(false);
        }
        Ok(matches!(
            line.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}
