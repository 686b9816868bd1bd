//! Secret-safe formatting for config values that end up in log lines.

use std::path::Path;

/// Render a path for logging without its leading directory components —
/// secret-bearing config (here: key file locations) never gets written to
/// logs in full.
pub fn mask_path(path: &Path) -> String {
    match path.file_name() {
        Some(name) => format!(".../{}", name.to_string_lossy()),
        None => "...".to_string(),
    }
}
