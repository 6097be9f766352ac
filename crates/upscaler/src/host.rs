use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use tokio::process::Command;

#[cfg(target_os = "macos")]
const OPEN_BIN: &str = "open";
#[cfg(target_os = "windows")]
const OPEN_BIN: &str = "explorer";
#[cfg(all(unix, not(target_os = "macos")))]
const OPEN_BIN: &str = "xdg-open";

/// Open a directory in the host file browser
pub fn open_path(path: &Path) -> Result<()> {
    info!("Opening {} in the file browser", path.display());
    Command::new(OPEN_BIN)
        .arg(path)
        .spawn()
        .with_context(|| format!("Failed to launch {}", OPEN_BIN))?;
    Ok(())
}

/// Shut the host machine down; invoked only as the opt-in post-batch action
pub async fn shutdown_computer() -> Result<()> {
    #[cfg(target_os = "windows")]
    let (bin, args) = ("shutdown", ["/s", "/t", "0"]);
    #[cfg(not(target_os = "windows"))]
    let (bin, args) = ("shutdown", ["-h", "now"]);

    let status = Command::new(bin)
        .args(args)
        .status()
        .await
        .with_context(|| format!("Failed to run {}", bin))?;
    if !status.success() {
        anyhow::bail!("{} exited with {}", bin, status);
    }
    Ok(())
}
