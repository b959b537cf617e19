//! Browser notifiers for a freshly started server

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use devrunner_core::{BrowserNotifier, NoopNotifier};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Reuses a Google Chrome tab through AppleScript (macOS)
#[derive(Debug, Clone)]
pub struct ChromeNotifier {
    application: String,
}

impl Default for ChromeNotifier {
    fn default() -> Self {
        Self {
            application: "Google Chrome".to_string(),
        }
    }
}

impl ChromeNotifier {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
        }
    }

    fn find_tab_script(&self, url_substring: &str) -> String {
        format!(
            r#"tell application "{app}"
    repeat with w in windows
        set tabIndex to 0
        repeat with t in tabs of w
            set tabIndex to tabIndex + 1
            if URL of t contains "{needle}" then
                set active tab index of w to tabIndex
                set index of w to 1
                activate
                return true
            end if
        end repeat
    end repeat
    return false
end tell"#,
            app = escape_applescript(&self.application),
            needle = escape_applescript(url_substring),
        )
    }

    fn refresh_script(&self) -> String {
        format!(
            r#"tell application "{}"
    tell front window
        reload active tab
    end tell
end tell"#,
            escape_applescript(&self.application)
        )
    }
}

fn escape_applescript(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

async fn osascript(script: &str) -> Result<String> {
    let output = Command::new("osascript")
        .args(["-e", script])
        .output()
        .await
        .context("failed to run osascript")?;
    if !output.status.success() {
        bail!(
            "osascript exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl BrowserNotifier for ChromeNotifier {
    async fn find_tab(&self, url_substring: &str) -> Result<bool> {
        let found = osascript(&self.find_tab_script(url_substring)).await? == "true";
        debug!(url_substring, found, "Chrome tab lookup");
        Ok(found)
    }

    async fn refresh_tab(&self) -> Result<()> {
        info!("Refreshing existing Chrome tab");
        osascript(&self.refresh_script()).await.map(|_| ())
    }

    async fn open_tab(&self, url: &str) -> Result<()> {
        info!(url, "Opening Chrome");
        let status = Command::new("open")
            .args(["-a", &self.application, url])
            .status()
            .await
            .context("failed to run open")?;
        if !status.success() {
            bail!("open -a {} exited with {status}", self.application);
        }
        Ok(())
    }
}

/// Opens the URL in the system default browser; cannot reuse tabs
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowserNotifier;

impl SystemBrowserNotifier {
    fn command(url: &str) -> Command {
        #[cfg(target_os = "macos")]
        {
            let mut cmd = Command::new("open");
            cmd.arg(url);
            cmd
        }
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", "", url]);
            cmd
        }
        #[cfg(not(any(target_os = "macos", windows)))]
        {
            let mut cmd = Command::new("xdg-open");
            cmd.arg(url);
            cmd
        }
    }
}

#[async_trait]
impl BrowserNotifier for SystemBrowserNotifier {
    async fn find_tab(&self, _url_substring: &str) -> Result<bool> {
        Ok(false)
    }

    async fn refresh_tab(&self) -> Result<()> {
        Ok(())
    }

    async fn open_tab(&self, url: &str) -> Result<()> {
        info!(url, "Opening browser");
        let status = Self::command(url)
            .status()
            .await
            .context("failed to launch browser")?;
        if !status.success() {
            bail!("browser launcher exited with {status}");
        }
        Ok(())
    }
}

/// Chrome on macOS, the system browser elsewhere, nothing when disabled
pub fn default_notifier(enabled: bool) -> Arc<dyn BrowserNotifier> {
    if !enabled {
        return Arc::new(NoopNotifier);
    }
    if cfg!(target_os = "macos") {
        Arc::new(ChromeNotifier::default())
    } else {
        Arc::new(SystemBrowserNotifier)
    }
}
