//! Scripted in-memory engine for lifecycle tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::*;
use crate::recognizer::Screenshot;

pub(crate) struct FakeEngine {
    pub max_cpus: u32,
    pub fail_install: bool,
    machines: Mutex<Vec<Arc<FakeMachine>>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            max_cpus: 8,
            fail_install: false,
            machines: Mutex::new(Vec::new()),
        }
    }
}

impl FakeEngine {
    /// Engine whose machines fail partway through install.
    pub fn failing_install() -> Self {
        Self {
            fail_install: true,
            ..Self::default()
        }
    }

    pub fn last_machine(&self) -> Option<Arc<FakeMachine>> {
        self.machines.lock().unwrap().last().cloned()
    }

    /// Minimal valid configuration rooted at `dir`.
    pub fn device_config(&self, dir: &Path) -> DeviceConfig {
        DeviceConfig {
            platform: Platform {
                aux_storage: dir.join("aux.img"),
                hardware_model: HardwareModel::from_bytes(b"fake-model".to_vec()),
                machine_identifier: self.new_machine_identifier(),
            },
            cpu_count: 2,
            memory_size: 2048 * 1024 * 1024,
            boot_loader: BootLoader::Firmware,
            displays: vec![DisplayDevice {
                width: 1024,
                height: 768,
            }],
            storage: vec![StorageDevice {
                path: dir.join("disk.img"),
                read_only: false,
                identifier: None,
            }],
            network: vec![NetworkDevice {
                attachment: NetworkAttachment::Nat,
                mac: None,
            }],
            standard_devices: Vec::new(),
            serial: None,
        }
    }

    pub fn restore_image(&self, dir: &Path) -> RestoreImage {
        RestoreImage {
            path: dir.join("restore.iso"),
            size: 4096,
            hardware_model: HardwareModel::from_bytes(b"fake-model".to_vec()),
        }
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn validate(&self, config: &DeviceConfig) -> Result<(), String> {
        if config.cpu_count > self.max_cpus {
            return Err(format!(
                "cpu count {} exceeds the maximum of {}",
                config.cpu_count, self.max_cpus
            ));
        }
        Ok(())
    }

    fn create_aux_storage(&self, path: &Path, model: &HardwareModel) -> std::io::Result<()> {
        std::fs::write(path, [b"aux:".as_slice(), model.as_bytes()].concat())
    }

    fn new_machine_identifier(&self) -> MachineIdentifier {
        MachineIdentifier::from_bytes(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    async fn load_restore_image(&self, path: &Path) -> Result<RestoreImage, VmctlError> {
        let size = std::fs::metadata(path)
            .map_err(|e| VmctlError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            })?
            .len();
        Ok(RestoreImage {
            path: path.to_path_buf(),
            size,
            hardware_model: HardwareModel::from_bytes(b"fake-model".to_vec()),
        })
    }

    async fn latest_restore_image(&self) -> Result<String, VmctlError> {
        Ok("https://images.invalid/fake-restore.iso".into())
    }

    fn create_machine(&self, config: DeviceConfig) -> Result<MachineHandle, VmctlError> {
        let (tx, events) = mpsc::unbounded_channel();
        let machine = Arc::new(FakeMachine {
            config,
            events: tx,
            calls: Mutex::new(Vec::new()),
            fail_install: self.fail_install,
        });
        self.machines.lock().unwrap().push(machine.clone());
        Ok(MachineHandle { machine, events })
    }
}

pub(crate) struct FakeMachine {
    pub config: DeviceConfig,
    events: mpsc::UnboundedSender<MachineEvent>,
    calls: Mutex<Vec<&'static str>>,
    fail_install: bool,
}

impl FakeMachine {
    /// Push a lifecycle event as if the engine had reported it.
    pub fn emit(&self, event: MachineEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Machine for FakeMachine {
    async fn start(&self, options: StartOptions) -> Result<(), VmctlError> {
        let call = if options.recovery {
            "start-recovery"
        } else {
            "start"
        };
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    /// Halts cleanly, like a guest honouring an ACPI shutdown.
    async fn request_stop(&self) -> Result<(), VmctlError> {
        self.calls.lock().unwrap().push("request_stop");
        self.emit(MachineEvent::GuestStopped);
        Ok(())
    }

    async fn install(
        &self,
        _image: &RestoreImage,
        progress: crate::installer::InstallProgress,
    ) -> Result<(), VmctlError> {
        self.calls.lock().unwrap().push("install");
        progress.report(0.25);
        tokio::task::yield_now().await;
        progress.report(0.5);
        if self.fail_install {
            return Err(VmctlError::engine("disk full", "free some space"));
        }
        Ok(())
    }
}

/// Records every key event with the (paused) tokio clock.
#[derive(Default)]
pub(crate) struct FakeKeyboard {
    events: Mutex<Vec<(KeyEvent, Instant)>>,
}

impl FakeKeyboard {
    pub fn events(&self) -> Vec<(KeyEvent, Instant)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyboardInput for FakeKeyboard {
    async fn send_key(&self, event: KeyEvent) -> Result<(), VmctlError> {
        self.events.lock().unwrap().push((event, Instant::now()));
        Ok(())
    }
}

/// Serves canned screen text, one frame per capture. The last frame
/// repeats once the list runs out.
pub(crate) struct FakeScreen {
    frames: Vec<String>,
    next: AtomicUsize,
    polls: AtomicUsize,
    failing: bool,
}

impl FakeScreen {
    pub fn new<I>(frames: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new(Vec::<String>::new())
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextRecognizer for FakeScreen {
    async fn capture(&self) -> Result<Screenshot, VmctlError> {
        if self.failing {
            return Err(VmctlError::ExternalCommand {
                command: "screenshot".into(),
                message: "display went away".into(),
            });
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let frame = self
            .frames
            .get(index)
            .or_else(|| self.frames.last())
            .cloned()
            .unwrap_or_default();
        Ok(Screenshot {
            data: frame.into_bytes(),
        })
    }

    async fn recognize(&self, image: &Screenshot) -> Result<String, VmctlError> {
        Ok(String::from_utf8_lossy(&image.data).into_owned())
    }
}

pub(crate) fn fake_display(keyboard: &Arc<FakeKeyboard>, screen: &Arc<FakeScreen>) -> Display {
    Display {
        keyboard: keyboard.clone(),
        recognizer: screen.clone(),
    }
}
