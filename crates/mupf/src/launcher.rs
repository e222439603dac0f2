//! Opens URLs in the user's default browser.

use std::process::Command;
use std::process::Stdio;

use tracing::debug;

use crate::error::Result;

/// Runs the platform opener for `url` and returns without waiting for it.
pub fn open(url: &str) -> Result<()> {
    let mut command = opener();
    command.arg(url).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    debug!(?command, "launching browser");
    command.spawn()?;
    Ok(())
}

#[cfg(target_os = "windows")]
fn opener() -> Command {
    let mut command = Command::new("cmd");
    // `start` takes the first quoted argument as a window title.
    command.args(["/C", "start", ""]);
    command
}

#[cfg(target_os = "macos")]
fn opener() -> Command {
    Command::new("open")
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn opener() -> Command {
    Command::new("xdg-open")
}
