//! libvirt/QEMU engine.
//!
//! Domains are transient from vmctl's point of view: defined right before
//! boot from the bundle's device configuration and undefined once the guest
//! has stopped. The bundle's `aux.img` is the domain's UEFI variable store.

pub mod catalog;
pub mod descriptor;
pub mod display;
pub mod domain_xml;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;
use virt::network::Network;

use self::descriptor::PlatformDescriptor;
use self::display::{VirshKeyboard, VirshScreenCapture};
use self::domain_xml::BootPlan;
use super::{
    DeviceConfig, Display, Engine, HardwareModel, Machine, MachineEvent, MachineHandle,
    MachineIdentifier, RestoreImage, StartOptions,
};
use crate::error::VmctlError;
use crate::installer::InstallProgress;
use crate::recognizer::TesseractRecognizer;

pub const DEFAULT_URI: &str = "qemu:///system";

const MIB: u64 = 1024 * 1024;
const MIN_MEMORY: u64 = 128 * MIB;
const MIN_DISPLAY: (u32, u32) = (640, 480);
const MAX_DISPLAY: (u32, u32) = (8192, 8192);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Install progress stays below this until the installer halts the guest.
const INSTALL_PROGRESS_CAP: f64 = 0.99;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

fn connect(uri: &str) -> Result<ConnGuard, VmctlError> {
    // Errors surface through Result; keep libvirt from printing them too.
    virt_error::clear_error_callback();

    Connect::open(Some(uri)).map(ConnGuard).map_err(|e| {
        VmctlError::engine(
            format!("failed to connect to libvirt: {e}"),
            format!("ensure libvirtd is running and you have access to {uri}"),
        )
    })
}

// ── Host limits ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct HostLimits {
    pub arch: String,
    pub cpus: u32,
    pub memory: Option<u64>,
}

impl HostLimits {
    fn detect() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            memory: std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|text| parse_meminfo(&text)),
        }
    }
}

/// Total memory in bytes from `/proc/meminfo` text.
fn parse_meminfo(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .and_then(|kib| kib.checked_mul(1024))
}

/// Check `config` against what this engine and `host` can run.
pub(crate) fn check_device_config(config: &DeviceConfig, host: &HostLimits) -> Result<(), String> {
    let descriptor = PlatformDescriptor::from_hardware_model(&config.platform.hardware_model)?;
    if descriptor.arch != host.arch {
        return Err(format!(
            "hardware model is for {}, this host is {}",
            descriptor.arch, host.arch
        ));
    }

    if config.platform.machine_identifier.as_bytes().len() != 16 {
        return Err("machine identifier must be 16 bytes".into());
    }

    if config.cpu_count < 1 || config.cpu_count > host.cpus {
        return Err(format!(
            "cpu count {} must be between 1 and the host's {} CPUs",
            config.cpu_count, host.cpus
        ));
    }

    if config.memory_size < MIN_MEMORY {
        return Err(format!(
            "memory size {} MB is below the minimum of {} MB",
            config.memory_size / MIB,
            MIN_MEMORY / MIB
        ));
    }
    if let Some(limit) = host.memory
        && config.memory_size > limit
    {
        return Err(format!(
            "memory size {} MB exceeds host memory of {} MB",
            config.memory_size / MIB,
            limit / MIB
        ));
    }

    for display in &config.displays {
        let fits = (MIN_DISPLAY.0..=MAX_DISPLAY.0).contains(&display.width)
            && (MIN_DISPLAY.1..=MAX_DISPLAY.1).contains(&display.height);
        if !fits {
            return Err(format!(
                "display {}x{} must be between {}x{} and {}x{}",
                display.width,
                display.height,
                MIN_DISPLAY.0,
                MIN_DISPLAY.1,
                MAX_DISPLAY.0,
                MAX_DISPLAY.1
            ));
        }
    }

    if let Some(missing) = config.storage.iter().find(|d| !d.path.is_file()) {
        return Err(format!("storage {} does not exist", missing.path.display()));
    }

    Ok(())
}

/// Domain name for a bundle: `vmctl-<bundle>-<uuid prefix>`.
pub fn domain_name(config: &DeviceConfig, uuid: &uuid::Uuid) -> String {
    let bundle = config
        .platform
        .aux_storage
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vm".into());
    let bundle: String = bundle
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let short = uuid.simple().to_string();
    format!("vmctl-{bundle}-{}", &short[..8])
}

fn domain_uuid(identifier: &MachineIdentifier) -> Result<uuid::Uuid, VmctlError> {
    uuid::Uuid::from_slice(identifier.as_bytes()).map_err(|e| VmctlError::InvalidConfiguration {
        constraint: format!("machine identifier is not a UUID: {e}"),
    })
}

// ── Engine ───────────────────────────────────────────────

pub struct LibvirtEngine {
    uri: String,
}

impl LibvirtEngine {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Name the domain for `config` will have once created.
    pub fn domain_name_for(&self, config: &DeviceConfig) -> Result<String, VmctlError> {
        let uuid = domain_uuid(&config.platform.machine_identifier)?;
        Ok(domain_name(config, &uuid))
    }
}

#[async_trait]
impl Engine for LibvirtEngine {
    fn validate(&self, config: &DeviceConfig) -> Result<(), String> {
        check_device_config(config, &HostLimits::detect())
    }

    fn create_aux_storage(&self, path: &Path, model: &HardwareModel) -> std::io::Result<()> {
        let descriptor = PlatformDescriptor::from_hardware_model(model)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::copy(descriptor.firmware_vars_path(), path)?;
        Ok(())
    }

    fn new_machine_identifier(&self) -> MachineIdentifier {
        MachineIdentifier::from_bytes(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    async fn load_restore_image(&self, path: &Path) -> Result<RestoreImage, VmctlError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| VmctlError::Io {
            context: format!("reading restore image {}", path.display()),
            source: e,
        })?;

        let descriptor = PlatformDescriptor::for_host().ok_or_else(|| {
            VmctlError::engine(
                format!("no UEFI firmware found for {}", std::env::consts::ARCH),
                "install edk2-ovmf (Fedora) or ovmf (Debian/Ubuntu)",
            )
        })?;
        let hardware_model = descriptor
            .to_hardware_model()
            .map_err(|e| VmctlError::engine(e, "this is a bug in vmctl"))?;

        tracing::info!(
            path = %path.display(),
            size = meta.len(),
            firmware = %descriptor.firmware_code,
            "restore image loaded"
        );
        Ok(RestoreImage {
            path: path.to_path_buf(),
            size: meta.len(),
            hardware_model,
        })
    }

    async fn latest_restore_image(&self) -> Result<String, VmctlError> {
        catalog::latest_restore_image(std::env::consts::ARCH).await
    }

    fn create_machine(&self, config: DeviceConfig) -> Result<MachineHandle, VmctlError> {
        let descriptor = PlatformDescriptor::from_hardware_model(&config.platform.hardware_model)
            .map_err(|constraint| VmctlError::InvalidConfiguration { constraint })?;
        let uuid = domain_uuid(&config.platform.machine_identifier)?;
        let name = domain_name(&config, &uuid);
        let (tx, events) = mpsc::unbounded_channel();

        let machine = LibvirtMachine {
            uri: self.uri.clone(),
            name,
            uuid,
            config,
            descriptor,
            events: tx,
            watcher: CancellationToken::new(),
        };
        Ok(MachineHandle {
            machine: Arc::new(machine),
            events,
        })
    }
}

// ── Machine ──────────────────────────────────────────────

pub struct LibvirtMachine {
    uri: String,
    name: String,
    uuid: uuid::Uuid,
    config: DeviceConfig,
    descriptor: PlatformDescriptor,
    events: mpsc::UnboundedSender<MachineEvent>,
    watcher: CancellationToken,
}

impl LibvirtMachine {
    fn domain_xml(&self, plan: BootPlan<'_>) -> String {
        domain_xml::generate_domain_xml(&self.name, &self.uuid, &self.config, &self.descriptor, plan)
    }

    /// Define the domain from `xml` and boot it.
    fn boot(&self, xml: &str) -> Result<(), VmctlError> {
        let conn = connect(&self.uri)?;
        ensure_default_network(&conn)?;

        if let Ok(existing) = Domain::lookup_by_name(&conn, &self.name) {
            if is_running(&existing) {
                return Err(VmctlError::engine(
                    format!("domain '{}' is already running", self.name),
                    "another vmctl process is using this bundle; stop it first",
                ));
            }
            undefine(&existing);
        }

        let dom = Domain::define_xml(&conn, xml).map_err(|e| {
            VmctlError::engine(
                format!("failed to define domain: {e}"),
                "check the vmctl log for the generated domain XML",
            )
        })?;
        tracing::debug!(name = %self.name, xml, "domain defined");

        if let Err(e) = dom.create() {
            undefine(&dom);
            return Err(VmctlError::engine(
                format!("failed to start domain: {e}"),
                format!("check `virsh -c {} start {}` for details", self.uri, self.name),
            ));
        }
        tracing::info!(name = %self.name, "domain started");
        Ok(())
    }

    fn display(&self) -> Display {
        let capture = VirshScreenCapture {
            uri: self.uri.clone(),
            domain: self.name.clone(),
        };
        Display {
            keyboard: Arc::new(VirshKeyboard {
                uri: self.uri.clone(),
                domain: self.name.clone(),
            }),
            recognizer: Arc::new(TesseractRecognizer::new(Arc::new(capture))),
        }
    }
}

impl Drop for LibvirtMachine {
    fn drop(&mut self) {
        self.watcher.cancel();
    }
}

#[async_trait]
impl Machine for LibvirtMachine {
    async fn start(&self, options: StartOptions) -> Result<(), VmctlError> {
        let xml = self.domain_xml(BootPlan {
            recovery: options.recovery,
            install_media: None,
        });
        self.boot(&xml)?;

        let uri = self.uri.clone();
        let name = self.name.clone();
        let events = self.events.clone();
        let cancel = self.watcher.clone();
        tokio::task::spawn_blocking(move || watch_domain(&uri, &name, &events, &cancel));

        if !self.config.displays.is_empty() {
            let _ = self.events.send(MachineEvent::DisplayReady(self.display()));
        }
        Ok(())
    }

    async fn request_stop(&self) -> Result<(), VmctlError> {
        let conn = connect(&self.uri)?;
        let dom = Domain::lookup_by_name(&conn, &self.name).map_err(|e| {
            VmctlError::engine(
                format!("domain '{}' not found: {e}", self.name),
                "the VM may already have stopped",
            )
        })?;
        tracing::info!(name = %self.name, "sending ACPI shutdown");
        dom.shutdown().map_err(|e| {
            VmctlError::engine(
                format!("shutdown failed: {e}"),
                "the guest may not support ACPI shutdown",
            )
        })?;
        Ok(())
    }

    async fn install(
        &self,
        image: &RestoreImage,
        progress: InstallProgress,
    ) -> Result<(), VmctlError> {
        let xml = self.domain_xml(BootPlan {
            recovery: false,
            install_media: Some(&image.path),
        });
        self.boot(&xml)?;

        let uri = self.uri.clone();
        let name = self.name.clone();
        let disk = self
            .config
            .storage
            .first()
            .map(|d| d.path.clone())
            .ok_or_else(|| VmctlError::InvalidConfiguration {
                constraint: "a boot disk is required for installation".into(),
            })?;
        let image_size = image.size;
        let cancel = self.watcher.clone();

        tokio::task::spawn_blocking(move || {
            watch_install(&uri, &name, &disk, image_size, &progress, &cancel)
        })
        .await
        .map_err(|e| VmctlError::engine(format!("install watcher failed: {e}"), "this is a bug in vmctl"))?
    }
}

// ── Domain helpers ───────────────────────────────────────

fn ensure_default_network(conn: &Connect) -> Result<(), VmctlError> {
    let net = Network::lookup_by_name(conn, "default").map_err(|_| {
        VmctlError::engine(
            "default network not found",
            "run `sudo virsh net-define /usr/share/libvirt/networks/default.xml && sudo virsh net-start default`",
        )
    })?;

    if !net.is_active().unwrap_or(false) {
        tracing::info!("starting inactive default network");
        net.create().map_err(|e| {
            VmctlError::engine(
                format!("failed to start default network: {e}"),
                "try `sudo virsh net-start default`",
            )
        })?;
    }
    Ok(())
}

fn is_running(dom: &Domain) -> bool {
    dom.is_active().unwrap_or(false)
}

fn crashed(dom: &Domain) -> bool {
    matches!(
        dom.get_state(),
        Ok((state, reason)) if state == virt::sys::VIR_DOMAIN_CRASHED
            || (state == virt::sys::VIR_DOMAIN_SHUTOFF
                && reason == virt::sys::VIR_DOMAIN_SHUTOFF_CRASHED as i32)
    )
}

/// Undefine, keeping the variable store: it lives in the bundle.
fn undefine(dom: &Domain) {
    if let Err(e) = dom.undefine_flags(virt::sys::VIR_DOMAIN_UNDEFINE_KEEP_NVRAM) {
        tracing::warn!(error = %e, "failed to undefine domain");
    }
}

fn default_network_active(conn: &Connect) -> bool {
    Network::lookup_by_name(conn, "default")
        .and_then(|net| net.is_active())
        .unwrap_or(false)
}

/// Poll a running domain once per second and report how it ends.
fn watch_domain(
    uri: &str,
    name: &str,
    events: &mpsc::UnboundedSender<MachineEvent>,
    cancel: &CancellationToken,
) {
    let conn = match connect(uri) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = events.send(MachineEvent::GuestFailed(e.to_string()));
            return;
        }
    };

    let mut network_up = default_network_active(&conn);
    while !cancel.is_cancelled() {
        std::thread::sleep(POLL_INTERVAL);

        let dom = match Domain::lookup_by_name(&conn, name) {
            Ok(dom) => dom,
            Err(e) => {
                let _ = events.send(MachineEvent::GuestFailed(format!(
                    "domain '{name}' disappeared: {e}"
                )));
                return;
            }
        };

        if !is_running(&dom) {
            let event = if crashed(&dom) {
                MachineEvent::GuestFailed("guest crashed".into())
            } else {
                MachineEvent::GuestStopped
            };
            undefine(&dom);
            let _ = events.send(event);
            return;
        }

        let up = default_network_active(&conn);
        if network_up && !up {
            let _ = events.send(MachineEvent::NetworkDisconnected);
        }
        network_up = up;
    }
}

/// Bytes actually allocated to `path`, which for a sparse disk image
/// tracks what the installer has written.
fn allocated_bytes(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.blocks() * 512).unwrap_or(0)
}

fn install_fraction(allocated: u64, image_size: u64) -> f64 {
    (allocated as f64 / image_size.max(1) as f64).min(INSTALL_PROGRESS_CAP)
}

fn watch_install(
    uri: &str,
    name: &str,
    disk: &Path,
    image_size: u64,
    progress: &InstallProgress,
    cancel: &CancellationToken,
) -> Result<(), VmctlError> {
    let conn = connect(uri)?;
    loop {
        if cancel.is_cancelled() {
            return Err(VmctlError::engine("install was cancelled", "run install again"));
        }
        std::thread::sleep(POLL_INTERVAL);

        let dom = Domain::lookup_by_name(&conn, name).map_err(|e| {
            VmctlError::engine(
                format!("domain '{name}' disappeared during install: {e}"),
                "check `virsh list --all`",
            )
        })?;

        if !is_running(&dom) {
            let failed = crashed(&dom);
            undefine(&dom);
            if failed {
                return Err(VmctlError::engine(
                    "guest crashed during install",
                    "check the restore image and the vmctl log next to the bundle",
                ));
            }
            return Ok(());
        }

        progress.report(install_fraction(allocated_bytes(disk), image_size));
    }
}
