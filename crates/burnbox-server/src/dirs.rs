use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform data directory for `burnbox.db` and `burnbox.salt`
/// (`~/.local/share/burnbox/` on Linux), created if missing.
///
/// Used only when `ServerConfig::data_dir` is unset.
pub fn platform_data_dir() -> Result<PathBuf> {
    let path = ProjectDirs::from("", "", "burnbox")
        .context("could not determine platform data directory")?
        .data_dir()
        .to_owned();
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir: {}", path.display()))?;
    Ok(path)
}
