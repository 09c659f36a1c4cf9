//! Best-effort default-browser launch

use std::io;
use std::process::{Command, Stdio};

/// Opens a URL for the user.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> io::Result<()>;
}

/// Launches the platform's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        let mut cmd = platform_command(url)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn platform_command(url: &str) -> io::Result<Command> {
    let mut cmd = Command::new("open");
    cmd.arg(url);
    Ok(cmd)
}

#[cfg(target_os = "windows")]
fn platform_command(url: &str) -> io::Result<Command> {
    let mut cmd = Command::new("cmd");
    // Empty title argument so `start` doesn't treat the URL as one
    cmd.args(["/C", "start", "", url]);
    Ok(cmd)
}

#[cfg(all(unix, not(target_os = "macos")))]
fn platform_command(url: &str) -> io::Result<Command> {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(url);
    Ok(cmd)
}

#[cfg(not(any(unix, target_os = "windows")))]
fn platform_command(_url: &str) -> io::Result<Command> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no browser launcher for this platform",
    ))
}

/// Never opens anything; the flow falls back to printing the URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBrowser;

impl BrowserLauncher for NoBrowser {
    fn open(&self, _url: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "browser launch disabled",
        ))
    }
}
