use std::collections::HashSet;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::bundle::VmBundle;
use crate::engine::{
    BootLoader, DeviceConfig, DisplayDevice, Engine, MacAddress, NetworkAttachment, NetworkDevice,
    SerialPort, StandardDevice, StorageDevice,
};
use crate::error::VmctlError;

const MIB: u64 = 1024 * 1024;

/// The config document as written by the user.
#[derive(Debug, Clone, Facet)]
#[facet(rename_all = "camelCase")]
pub struct Config {
    pub cpu_count: u32,
    #[facet(rename = "memoryMB")]
    pub memory_mb: u64,
    #[facet(default = true)]
    pub no_graphics: bool,
    pub display_width: u32,
    pub display_height: u32,
    #[facet(default)]
    pub additional_disks: Vec<DiskConfig>,
    #[facet(default)]
    pub mac_address: Option<String>,
    #[facet(default = true)]
    pub tty: bool,
}

#[derive(Debug, Clone, Facet)]
#[facet(rename_all = "camelCase")]
pub struct DiskConfig {
    pub path: String,
    #[facet(default)]
    pub read_only: bool,
    /// Serial number shown to the guest.
    #[facet(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDisk {
    pub path: PathBuf,
    pub read_only: bool,
    pub id: Option<String>,
}

/// A loaded config with every path resolved. Immutable once built.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub config_path: PathBuf,
    pub config: Config,
    pub disks: Vec<ResolvedDisk>,
    pub mac_address: Option<MacAddress>,
}

impl VmConfig {
    pub fn graphics(&self) -> bool {
        !self.config.no_graphics
    }

    pub fn tty(&self) -> bool {
        self.config.tty
    }

    /// Assemble the engine device configuration for `bundle`.
    ///
    /// Platform identity is read from the bundle, never generated. The
    /// result is checked by `engine.validate` before it is returned.
    pub fn instantiate(
        &self,
        bundle: &VmBundle,
        engine: &dyn Engine,
    ) -> Result<DeviceConfig, VmctlError> {
        let platform = bundle.platform()?;
        let memory_size = memory_bytes(self.config.memory_mb)?;

        let mut storage = vec![StorageDevice {
            path: bundle.disk_image(),
            read_only: false,
            identifier: None,
        }];
        storage.extend(self.disks.iter().map(|d| StorageDevice {
            path: d.path.clone(),
            read_only: d.read_only,
            identifier: d.id.clone(),
        }));

        let device_config = DeviceConfig {
            platform,
            cpu_count: self.config.cpu_count,
            memory_size,
            boot_loader: BootLoader::Firmware,
            displays: vec![DisplayDevice {
                width: self.config.display_width,
                height: self.config.display_height,
            }],
            storage,
            network: vec![NetworkDevice {
                attachment: NetworkAttachment::Nat,
                mac: self.mac_address,
            }],
            standard_devices: vec![
                StandardDevice::Pointer,
                StandardDevice::Keyboard,
                StandardDevice::Entropy,
                StandardDevice::MemoryBalloon,
            ],
            serial: self.config.tty.then_some(SerialPort::Stdio),
        };

        engine
            .validate(&device_config)
            .map_err(|constraint| VmctlError::InvalidConfiguration { constraint })?;

        tracing::debug!(bundle = %bundle.path().display(), "device configuration assembled");
        Ok(device_config)
    }
}

fn invalid(constraint: impl Into<String>) -> VmctlError {
    VmctlError::InvalidConfiguration {
        constraint: constraint.into(),
    }
}

fn memory_bytes(memory_mb: u64) -> Result<u64, VmctlError> {
    memory_mb
        .checked_mul(MIB)
        .ok_or_else(|| invalid(format!("memoryMB {memory_mb} is too large")))
}

fn validate_config(config: &Config) -> Result<Option<MacAddress>, VmctlError> {
    if config.cpu_count < 1 {
        return Err(invalid("cpuCount must be at least 1"));
    }
    if config.memory_mb < 1 {
        return Err(invalid("memoryMB must be at least 1"));
    }
    memory_bytes(config.memory_mb)?;
    if config.display_width == 0 || config.display_height == 0 {
        return Err(invalid("displayWidth and displayHeight must be positive"));
    }

    let mut seen_ids = HashSet::new();
    for disk in &config.additional_disks {
        if disk.path.trim().is_empty() {
            return Err(invalid("additional disk path must not be empty"));
        }
        if let Some(id) = &disk.id
            && !seen_ids.insert(id.as_str())
        {
            return Err(invalid(format!("duplicate additional disk id '{id}'")));
        }
    }

    config
        .mac_address
        .as_deref()
        .map(|s| s.parse::<MacAddress>().map_err(invalid))
        .transpose()
}

fn resolve_disks(config: &Config, config_dir: &Path) -> Result<Vec<ResolvedDisk>, VmctlError> {
    config
        .additional_disks
        .iter()
        .map(|disk| {
            let raw = Path::new(&disk.path);
            let joined = if raw.is_absolute() {
                raw.to_path_buf()
            } else {
                config_dir.join(raw)
            };
            let path = joined.canonicalize().map_err(|e| {
                invalid(format!(
                    "additional disk {} cannot be resolved: {e}",
                    joined.display()
                ))
            })?;
            Ok(ResolvedDisk {
                path,
                read_only: disk.read_only,
                id: disk.id.clone(),
            })
        })
        .collect()
}

// ── public API ────────────────────────────────────────────

/// Load, validate and resolve the config document at `path`.
///
/// Relative disk paths are taken from the document's directory and every
/// symlink is resolved here, once.
pub fn load_config(path: &Path) -> Result<VmConfig, VmctlError> {
    let contents = std::fs::read_to_string(path).map_err(|source| VmctlError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_json::from_str(&contents).map_err(|e| VmctlError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mac_address = validate_config(&config)?;

    let canonical = path.canonicalize().map_err(|source| VmctlError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let config_dir = canonical.parent().unwrap_or(Path::new("/"));
    let disks = resolve_disks(&config, config_dir)?;

    tracing::debug!(
        path = %canonical.display(),
        cpus = config.cpu_count,
        memory_mb = config.memory_mb,
        disks = disks.len(),
        "loaded config"
    );

    Ok(VmConfig {
        config_path: canonical,
        config,
        disks,
        mac_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;
    use crate::engine::HardwareModel;

    const MINIMAL: &str = r#"{
        "cpuCount": 2,
        "memoryMB": 4096,
        "displayWidth": 1920,
        "displayHeight": 1080
    }"#;

    fn write_config(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("vm.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn parse_minimal_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&write_config(dir.path(), MINIMAL)).unwrap();
        assert_eq!(loaded.config.cpu_count, 2);
        assert_eq!(loaded.config.memory_mb, 4096);
        assert!(loaded.config.no_graphics);
        assert!(loaded.config.tty);
        assert!(!loaded.graphics());
        assert!(loaded.disks.is_empty());
        assert_eq!(loaded.mac_address, None);
    }

    #[test]
    fn parse_full_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.img"), b"").unwrap();
        let json = r#"{
            "cpuCount": 4,
            "memoryMB": 8192,
            "noGraphics": false,
            "displayWidth": 1280,
            "displayHeight": 800,
            "additionalDisks": [{"path": "data.img", "readOnly": true, "id": "data"}],
            "macAddress": "52:54:00:12:34:56",
            "tty": false
        }"#;
        let loaded = load_config(&write_config(dir.path(), json)).unwrap();
        assert!(loaded.graphics());
        assert!(!loaded.tty());
        assert_eq!(loaded.disks.len(), 1);
        assert!(loaded.disks[0].read_only);
        assert_eq!(loaded.disks[0].id.as_deref(), Some("data"));
        assert_eq!(
            loaded.mac_address.map(|m| m.to_string()).as_deref(),
            Some("52:54:00:12:34:56")
        );
    }

    #[test]
    fn relative_disks_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("disks");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("extra.img"), b"").unwrap();
        let json = r#"{
            "cpuCount": 1, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600,
            "additionalDisks": [{"path": "disks/extra.img"}]
        }"#;
        let loaded = load_config(&write_config(dir.path(), json)).unwrap();
        assert_eq!(
            loaded.disks[0].path,
            sub.join("extra.img").canonicalize().unwrap()
        );
        assert!(!loaded.disks[0].read_only);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_disk_resolves_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.img");
        std::fs::write(&target, b"").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link.img")).unwrap();
        let json = r#"{
            "cpuCount": 1, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600,
            "additionalDisks": [{"path": "link.img"}]
        }"#;
        let loaded = load_config(&write_config(dir.path(), json)).unwrap();
        assert_eq!(loaded.disks[0].path, target.canonicalize().unwrap());
    }

    #[test]
    fn missing_document_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, VmctlError::ConfigLoad { .. }));
    }

    #[test]
    fn malformed_document_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&write_config(dir.path(), r#"{"cpuCount": "two"}"#)).unwrap_err();
        assert!(matches!(err, VmctlError::ConfigParse { .. }));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases = [
            r#"{"cpuCount": 0, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600}"#,
            r#"{"cpuCount": 1, "memoryMB": 0, "displayWidth": 800, "displayHeight": 600}"#,
            r#"{"cpuCount": 1, "memoryMB": 512, "displayWidth": 0, "displayHeight": 600}"#,
            r#"{"cpuCount": 1, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600,
                "macAddress": "not-a-mac"}"#,
            r#"{"cpuCount": 1, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600,
                "additionalDisks": [{"path": ""}]}"#,
            r#"{"cpuCount": 1, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600,
                "additionalDisks": [{"path": "missing.img"}]}"#,
        ];
        for json in cases {
            let dir = tempfile::tempdir().unwrap();
            let err = load_config(&write_config(dir.path(), json)).unwrap_err();
            assert!(
                matches!(err, VmctlError::InvalidConfiguration { .. }),
                "expected rejection of {json}, got {err:?}"
            );
        }
    }

    #[test]
    fn duplicate_disk_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.img"), b"").unwrap();
        std::fs::write(dir.path().join("b.img"), b"").unwrap();
        let json = r#"{
            "cpuCount": 1, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600,
            "additionalDisks": [{"path": "a.img", "id": "x"}, {"path": "b.img", "id": "x"}]
        }"#;
        let err = load_config(&write_config(dir.path(), json)).unwrap_err();
        assert!(err.to_string().contains("duplicate additional disk id 'x'"));
    }

    async fn bundle_in(dir: &Path, engine: &FakeEngine) -> VmBundle {
        let bundle = VmBundle::create(dir.join("vm")).await.unwrap();
        bundle
            .setup(engine, &HardwareModel::from_bytes(b"hw".to_vec()), 1)
            .await
            .unwrap();
        bundle
    }

    #[tokio::test]
    async fn instantiate_assembles_devices_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.img"), b"").unwrap();
        let json = r#"{
            "cpuCount": 2, "memoryMB": 1024, "displayWidth": 1024, "displayHeight": 768,
            "additionalDisks": [{"path": "data.img", "readOnly": true, "id": "data"}],
            "macAddress": "52:54:00:aa:bb:cc"
        }"#;
        let loaded = load_config(&write_config(dir.path(), json)).unwrap();
        let engine = FakeEngine::default();
        let bundle = bundle_in(dir.path(), &engine).await;

        let device = loaded.instantiate(&bundle, &engine).unwrap();

        assert_eq!(device.platform.aux_storage, bundle.aux_storage());
        assert_eq!(device.platform.hardware_model.as_bytes(), b"hw");
        assert_eq!(
            device.platform.machine_identifier,
            bundle.machine_identifier().unwrap()
        );
        assert_eq!(device.cpu_count, 2);
        assert_eq!(device.memory_size, 1024 * 1024 * 1024);
        assert_eq!(
            device.displays,
            vec![DisplayDevice {
                width: 1024,
                height: 768
            }]
        );
        assert_eq!(device.storage.len(), 2);
        assert_eq!(device.storage[0].path, bundle.disk_image());
        assert!(!device.storage[0].read_only);
        assert!(device.storage[1].read_only);
        assert_eq!(device.storage[1].identifier.as_deref(), Some("data"));
        assert_eq!(device.network.len(), 1);
        assert_eq!(device.network[0].attachment, NetworkAttachment::Nat);
        assert_eq!(device.network[0].mac, loaded.mac_address);
        assert_eq!(device.standard_devices.len(), 4);
        assert_eq!(device.serial, Some(SerialPort::Stdio));
    }

    #[tokio::test]
    async fn instantiate_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&write_config(dir.path(), MINIMAL)).unwrap();
        let engine = FakeEngine::default();
        let bundle = bundle_in(dir.path(), &engine).await;

        let first = loaded.instantiate(&bundle, &engine).unwrap();
        let second = loaded.instantiate(&bundle, &engine).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn instantiate_surfaces_engine_constraint() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{"cpuCount": 64, "memoryMB": 512, "displayWidth": 800, "displayHeight": 600}"#;
        let loaded = load_config(&write_config(dir.path(), json)).unwrap();
        let engine = FakeEngine::default();
        let bundle = bundle_in(dir.path(), &engine).await;

        match loaded.instantiate(&bundle, &engine) {
            Err(VmctlError::InvalidConfiguration { constraint }) => {
                assert!(constraint.contains("cpu count 64"), "got: {constraint}");
            }
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn oversized_memory_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{"cpuCount": 1, "memoryMB": 17592186045440, "displayWidth": 800, "displayHeight": 600}"#;
        let err = load_config(&write_config(dir.path(), json)).unwrap_err();
        assert!(
            err.to_string().contains("memoryMB 17592186045440 is too large"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn instantiate_rejects_oversized_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut loaded = load_config(&write_config(dir.path(), MINIMAL)).unwrap();
        let engine = FakeEngine::default();
        let bundle = bundle_in(dir.path(), &engine).await;

        loaded.config.memory_mb = u64::MAX;
        let err = loaded.instantiate(&bundle, &engine).unwrap_err();
        assert!(matches!(err, VmctlError::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn instantiate_without_setup_is_bundle_error() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&write_config(dir.path(), MINIMAL)).unwrap();
        let bundle = VmBundle::create(dir.path().join("empty")).await.unwrap();
        let err = loaded
            .instantiate(&bundle, &FakeEngine::default())
            .unwrap_err();
        assert!(matches!(err, VmctlError::BundleIo { .. }));
    }
}
