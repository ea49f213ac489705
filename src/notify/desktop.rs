//! Desktop notifications
//!
//! - Linux: notify-send (libnotify)
//! - macOS: osascript (AppleScript)

use super::{NotificationChannel, Priority};
use crate::error::NotifyError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

const TITLE: &str = "cribwatch";

#[derive(Debug, Default)]
pub struct DesktopChannel;

impl DesktopChannel {
    pub fn new() -> Self {
        Self
    }
}

/// notify-send urgency for an alert priority
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn urgency(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High | Priority::Urgent => "critical",
    }
}

/// Escape a string for an AppleScript string literal
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn applescript_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(target_os = "linux")]
async fn send_native(
    message: &str,
    priority: Priority,
    attachment: Option<&Path>,
) -> Result<(), NotifyError> {
    let mut cmd = Command::new("notify-send");
    cmd.arg("--app-name=cribwatch")
        .arg(format!("--urgency={}", urgency(priority)));
    if let Some(path) = attachment {
        cmd.arg(format!("--icon={}", path.display()));
    }
    let status = cmd
        .args([TITLE, message])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| NotifyError::Command(format!("notify-send: {}", e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(NotifyError::Command(format!("notify-send exited with {}", status)))
    }
}

#[cfg(target_os = "macos")]
async fn send_native(
    message: &str,
    _priority: Priority,
    _attachment: Option<&Path>,
) -> Result<(), NotifyError> {
    let script = format!(
        r#"display notification "{}" with title "{}""#,
        applescript_escape(message),
        applescript_escape(TITLE)
    );
    let status = Command::new("osascript")
        .args(["-e", &script])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| NotifyError::Command(format!("osascript: {}", e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(NotifyError::Command(format!("osascript exited with {}", status)))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn send_native(
    _message: &str,
    _priority: Priority,
    _attachment: Option<&Path>,
) -> Result<(), NotifyError> {
    Err(NotifyError::Command(
        "desktop notifications not supported on this platform".into(),
    ))
}

#[async_trait::async_trait]
impl NotificationChannel for DesktopChannel {
    async fn send(
        &self,
        message: &str,
        priority: Priority,
        attachment: Option<&Path>,
    ) -> Result<(), NotifyError> {
        send_native(message, priority, attachment).await
    }

    fn name(&self) -> &'static str {
        "desktop"
    }
}
