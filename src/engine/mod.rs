//! The virtualization engine seam.
//!
//! Everything vmctl needs from a hypervisor goes through [`Engine`] and
//! [`Machine`]. The orchestrator assembles a [`DeviceConfig`], asks the
//! engine to validate it, and then drives a machine handle whose lifecycle
//! is reported back as [`MachineEvent`]s.

pub mod libvirt;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::VmctlError;
use crate::installer::InstallProgress;
use crate::keyscript::KeyEvent;
use crate::recognizer::TextRecognizer;

// ── Identity blobs ──────────────────────────────────────────

/// Opaque hardware descriptor, fixed once written into a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareModel(Vec<u8>);

impl HardwareModel {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque machine identifier, fixed once written into a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentifier(Vec<u8>);

impl MachineIdentifier {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A loaded restore image: where it lives and the hardware it wants.
#[derive(Debug, Clone)]
pub struct RestoreImage {
    pub path: PathBuf,
    pub size: u64,
    pub hardware_model: HardwareModel,
}

// ── Device configuration ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("MAC address '{s}' must have six ':'-separated octets"));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(format!("MAC address '{s}' has malformed octet '{part}'"));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("MAC address '{s}' has malformed octet '{part}'"))?;
        }
        if octets[0] & 0x01 != 0 {
            return Err(format!("MAC address '{s}' is multicast"));
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Identity of the guest platform, read from a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub aux_storage: PathBuf,
    pub hardware_model: HardwareModel,
    pub machine_identifier: MachineIdentifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootLoader {
    /// The platform firmware, backed by the auxiliary storage.
    Firmware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayDevice {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub path: PathBuf,
    pub read_only: bool,
    /// Serial reported to the guest, if any.
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAttachment {
    Nat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDevice {
    pub attachment: NetworkAttachment,
    /// `None` lets the engine assign one.
    pub mac: Option<MacAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardDevice {
    Pointer,
    Keyboard,
    Entropy,
    MemoryBalloon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPort {
    /// Bound to the controlling process's stdin/stdout.
    Stdio,
}

/// Engine-ready description of one VM, assembled by `Config::instantiate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub platform: Platform,
    pub cpu_count: u32,
    pub memory_size: u64,
    pub boot_loader: BootLoader,
    pub displays: Vec<DisplayDevice>,
    /// Boot disk first, then additional disks in config order.
    pub storage: Vec<StorageDevice>,
    pub network: Vec<NetworkDevice>,
    pub standard_devices: Vec<StandardDevice>,
    pub serial: Option<SerialPort>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Boot into the guest's recovery environment.
    pub recovery: bool,
}

// ── Machine lifecycle ───────────────────────────────────────

/// Keyboard input into a running guest.
#[async_trait]
pub trait KeyboardInput: Send + Sync {
    async fn send_key(&self, event: KeyEvent) -> Result<(), VmctlError>;
}

/// A live display surface: where input goes and how its text is read.
#[derive(Clone)]
pub struct Display {
    pub keyboard: Arc<dyn KeyboardInput>,
    pub recognizer: Arc<dyn TextRecognizer>,
}

impl fmt::Debug for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display").finish_non_exhaustive()
    }
}

/// Lifecycle notifications pushed by the engine.
#[derive(Debug, Clone)]
pub enum MachineEvent {
    DisplayReady(Display),
    /// The guest halted cleanly.
    GuestStopped,
    /// The guest stopped because of an error.
    GuestFailed(String),
    /// The host network attachment went away; the guest keeps running.
    NetworkDisconnected,
}

/// A created machine plus its event stream.
pub struct MachineHandle {
    pub machine: Arc<dyn Machine>,
    pub events: mpsc::UnboundedReceiver<MachineEvent>,
}

#[async_trait]
pub trait Machine: Send + Sync {
    /// Ask the engine to boot. Returns once the request is accepted.
    async fn start(&self, options: StartOptions) -> Result<(), VmctlError>;

    /// Request an orderly guest shutdown. Completion arrives as an event.
    async fn request_stop(&self) -> Result<(), VmctlError>;

    /// Install `image` into the machine's boot disk, reporting progress.
    async fn install(
        &self,
        image: &RestoreImage,
        progress: InstallProgress,
    ) -> Result<(), VmctlError>;
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Check `config` against the engine's rules. The error names the
    /// violated constraint.
    fn validate(&self, config: &DeviceConfig) -> Result<(), String>;

    /// Create auxiliary boot storage for `model` at `path`, overwriting.
    fn create_aux_storage(&self, path: &Path, model: &HardwareModel) -> std::io::Result<()>;

    fn new_machine_identifier(&self) -> MachineIdentifier;

    async fn load_restore_image(&self, path: &Path) -> Result<RestoreImage, VmctlError>;

    /// Reference (URL) of the newest restore image this host can install.
    async fn latest_restore_image(&self) -> Result<String, VmctlError>;

    fn create_machine(&self, config: DeviceConfig) -> Result<MachineHandle, VmctlError>;
}
