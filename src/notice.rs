use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::UiConfig;

/// Shows notices the user has to acknowledge before carrying on.
#[derive(Clone)]
pub struct Notifier {
    config: UiConfig,
    has_zenity: bool,
    has_kdialog: bool,
}

impl Notifier {
    pub fn with_config(config: &UiConfig) -> Self {
        let has_zenity = which::which("zenity").is_ok();
        let has_kdialog = which::which("kdialog").is_ok();

        debug!(
            "Dialog capabilities: zenity={}, kdialog={}",
            has_zenity, has_kdialog
        );

        Self {
            config: config.clone(),
            has_zenity,
            has_kdialog,
        }
    }

    /// Display a modal dialog and wait until it is dismissed.
    ///
    /// Returns `false` when no dialog could be shown and the caller should
    /// print the notice itself.
    pub async fn show_blocking(&self, title: &str, message: &str) -> Result<bool> {
        warn!("{}: {}", title, message);

        if !self.config.show_dialogs {
            return Ok(false);
        }

        let output = if self.has_zenity {
            Command::new("zenity")
                .args(["--info", "--title", title, "--text", message])
                .output()
                .await
        } else if self.has_kdialog {
            Command::new("kdialog")
                .args(["--title", title, "--msgbox", message])
                .output()
                .await
        } else {
            return Ok(false);
        };

        let output = output.context("failed to show dialog")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("Dialog exited with {}: {}", output.status, stderr);
        }

        Ok(true)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::with_config(&UiConfig::default())
    }
}
