use crate::analysis::AnalysisResult;

/// Render the block screen shown when an installation is withheld.
///
/// `show_reference` is false for user-declined confirmations: there is no
/// verified finding to point at, the user simply said no.
pub fn render_block_screen(result: &AnalysisResult, show_reference: bool) -> String {
    let mut screen = String::new();
    screen.push_str("============================================================\n");
    screen.push_str("  INSTALLATION BLOCKED\n");
    screen.push_str("============================================================\n");
    screen.push_str(&format!("  Ecosystem: {}\n", result.package.ecosystem()));
    screen.push_str(&format!("  Package:   {}\n", result.package.name()));
    if result.package.is_resolved() {
        screen.push_str(&format!("  Version:   {}\n", result.package.version()));
    }
    if !result.summary.is_empty() {
        screen.push_str(&format!("  Reason:    {}\n", result.summary));
    }
    if show_reference && !result.reference_url.is_empty() {
        screen.push_str(&format!("  Reference: {}\n", result.reference_url));
    }
    screen.push_str("============================================================\n");
    screen.push_str("  The package manager was not executed.\n");
    screen.push_str("============================================================\n");
    screen
}

/// Write the block screen to stderr, keeping stdout for the wrapped tool.
pub fn print_block_screen(result: &AnalysisResult, show_reference: bool) {
    eprint!("{}", render_block_screen(result, show_reference));
}
