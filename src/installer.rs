use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::{DeviceConfig, Engine, MachineEvent, RestoreImage};
use crate::error::VmctlError;

/// Writer half of the install progress channel.
///
/// Reported fractions are clamped to `[0.0, 1.0]` and never move backwards,
/// so readers can render the value without smoothing it themselves.
#[derive(Clone)]
pub struct InstallProgress {
    tx: Arc<watch::Sender<f64>>,
}

impl InstallProgress {
    pub fn channel() -> (Self, watch::Receiver<f64>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn report(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> f64 {
        *self.tx.borrow()
    }
}

/// A running installation of a restore image into a fresh machine.
pub struct Installer {
    progress: watch::Receiver<f64>,
    task: JoinHandle<Result<(), VmctlError>>,
}

impl Installer {
    /// Create a machine from `config` and begin installing `image` into it.
    ///
    /// Must be called from within a tokio runtime. No retry is attempted on
    /// failure; the bundle has to be set up again before another attempt.
    pub fn start(
        engine: &dyn Engine,
        config: DeviceConfig,
        image: RestoreImage,
    ) -> Result<Self, VmctlError> {
        let handle = engine.create_machine(config)?;
        let (reporter, progress) = InstallProgress::channel();

        tracing::info!(image = %image.path.display(), size = image.size, "starting install");

        let machine = handle.machine;
        let mut events = handle.events;
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                result = machine.install(&image, reporter.clone()) => result,
                failure = guest_failure(&mut events) => Err(failure),
            };
            match result {
                Ok(()) => {
                    reporter.report(1.0);
                    tracing::info!("install finished");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %e, "install failed");
                    Err(VmctlError::Install {
                        source: Box::new(e),
                    })
                }
            }
        });

        Ok(Self { progress, task })
    }

    /// Fraction of the install completed so far.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    pub async fn wait(self) -> Result<(), VmctlError> {
        self.task.await.map_err(|e| VmctlError::Install {
            source: Box::new(VmctlError::engine(
                format!("install task ended unexpectedly: {e}"),
                "this is a bug in vmctl",
            )),
        })?
    }
}

/// Resolves only if the engine reports the guest failed during install.
async fn guest_failure(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<MachineEvent>,
) -> VmctlError {
    loop {
        match events.recv().await {
            Some(MachineEvent::GuestFailed(detail)) => {
                return VmctlError::engine(
                    format!("guest failed during install: {detail}"),
                    "check the restore image and the vmctl log next to the bundle",
                );
            }
            Some(other) => tracing::debug!(event = ?other, "ignoring event during install"),
            None => std::future::pending::<()>().await,
        }
    }
}
