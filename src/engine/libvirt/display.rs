//! Guest input and screen capture through `virsh`.

use async_trait::async_trait;

use crate::engine::KeyboardInput;
use crate::error::VmctlError;
use crate::keyscript::KeyEvent;
use crate::recognizer::{ScreenCapture, Screenshot};

/// QMP command that presses or releases one key.
pub fn input_event_command(event: KeyEvent) -> String {
    format!(
        r#"{{"execute":"input-send-event","arguments":{{"events":[{{"type":"key","data":{{"down":{},"key":{{"type":"qcode","data":"{}"}}}}}}]}}}}"#,
        event.down,
        event.key.qcode()
    )
}

async fn virsh(uri: &str, args: &[&str]) -> Result<Vec<u8>, VmctlError> {
    let output = tokio::process::Command::new("virsh")
        .args(["-c", uri])
        .args(args)
        .output()
        .await
        .map_err(|e| VmctlError::Io {
            context: "running virsh".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(VmctlError::ExternalCommand {
            command: format!("virsh {}", args.first().copied().unwrap_or_default()),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Sends key events over the domain's QEMU monitor.
pub struct VirshKeyboard {
    pub uri: String,
    pub domain: String,
}

#[async_trait]
impl KeyboardInput for VirshKeyboard {
    async fn send_key(&self, event: KeyEvent) -> Result<(), VmctlError> {
        let command = input_event_command(event);
        virsh(&self.uri, &["qemu-monitor-command", &self.domain, &command]).await?;
        Ok(())
    }
}

/// Captures the domain's primary display with `virsh screenshot`.
pub struct VirshScreenCapture {
    pub uri: String,
    pub domain: String,
}

#[async_trait]
impl ScreenCapture for VirshScreenCapture {
    async fn capture(&self) -> Result<Screenshot, VmctlError> {
        let file = tempfile::Builder::new()
            .prefix("vmctl-screen-")
            .suffix(".ppm")
            .tempfile()
            .map_err(|e| VmctlError::Io {
                context: "creating screenshot file".into(),
                source: e,
            })?;
        let path = file.path().display().to_string();

        virsh(&self.uri, &["screenshot", &self.domain, &path, "--screen", "0"]).await?;

        let data = tokio::fs::read(file.path())
            .await
            .map_err(|e| VmctlError::Io {
                context: format!("reading screenshot {path}"),
                source: e,
            })?;
        Ok(Screenshot { data })
    }
}
