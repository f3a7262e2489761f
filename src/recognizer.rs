//! Screen text recognition.
//!
//! The runner only needs two things from a recognizer: a capture of the
//! current screen and the text found in it. [`TesseractRecognizer`] pairs an
//! engine-provided [`ScreenCapture`] with the `tesseract` CLI.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::VmctlError;

/// A captured frame in a format the recognizer can read (PNG, PPM, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub data: Vec<u8>,
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Capture the current display surface.
    async fn capture(&self) -> Result<Screenshot, VmctlError>;

    /// All text fragments in `image`, joined by spaces in recognition order.
    async fn recognize(&self, image: &Screenshot) -> Result<String, VmctlError>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Screenshot, VmctlError>;
}

pub struct TesseractRecognizer {
    capture: Arc<dyn ScreenCapture>,
    program: String,
}

impl TesseractRecognizer {
    pub fn new(capture: Arc<dyn ScreenCapture>) -> Self {
        Self {
            capture,
            program: "tesseract".into(),
        }
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn capture(&self) -> Result<Screenshot, VmctlError> {
        self.capture.capture().await
    }

    async fn recognize(&self, image: &Screenshot) -> Result<String, VmctlError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(["stdin", "stdout", "--psm", "11"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VmctlError::Io {
                context: format!("running {}", self.program),
                source: e,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&image.data)
                .await
                .map_err(|e| VmctlError::Io {
                    context: format!("writing screenshot to {}", self.program),
                    source: e,
                })?;
        }

        let output = child.wait_with_output().await.map_err(|e| VmctlError::Io {
            context: format!("waiting for {}", self.program),
            source: e,
        })?;

        if !output.status.success() {
            return Err(VmctlError::ExternalCommand {
                command: self.program.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(join_fragments(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Collapse recognizer output into one line of space-separated fragments.
pub fn join_fragments(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
