//! The hardware model this engine writes into bundles.
//!
//! It is a small JSON document naming the guest architecture, machine type
//! and UEFI firmware files. Bundles store it verbatim as `model.dat`.

use std::path::{Path, PathBuf};

use facet::Facet;

use crate::engine::HardwareModel;
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
#[facet(rename_all = "camelCase")]
pub struct PlatformDescriptor {
    pub arch: String,
    pub machine: String,
    /// Read-only firmware image.
    pub firmware_code: String,
    /// Template copied into a bundle's auxiliary storage.
    pub firmware_vars: String,
}

/// Firmware file pairs tried in order, per arch.
const FIRMWARE_CANDIDATES: &[(&str, &str, &str)] = &[
    ("x86_64", "OVMF_CODE.fd", "OVMF_VARS.fd"),
    ("x86_64", "OVMF_CODE_4M.fd", "OVMF_VARS_4M.fd"),
    ("aarch64", "QEMU_EFI-pflash.raw", "vars-template-pflash.raw"),
    ("aarch64", "AAVMF_CODE.fd", "AAVMF_VARS.fd"),
];

impl PlatformDescriptor {
    pub fn machine_type_for(arch: &str) -> &'static str {
        match arch {
            "aarch64" => "virt",
            _ => "q35",
        }
    }

    /// Describe the host, locating firmware under `search_dirs`.
    pub fn for_host_in(arch: &str, search_dirs: &[PathBuf]) -> Option<Self> {
        FIRMWARE_CANDIDATES
            .iter()
            .filter(|(a, _, _)| *a == arch)
            .find_map(|(_, code, vars)| {
                search_dirs.iter().find_map(|dir| {
                    let code = dir.join(code);
                    let vars = dir.join(vars);
                    (code.is_file() && vars.is_file()).then(|| Self {
                        arch: arch.to_string(),
                        machine: Self::machine_type_for(arch).to_string(),
                        firmware_code: code.display().to_string(),
                        firmware_vars: vars.display().to_string(),
                    })
                })
            })
    }

    pub fn for_host() -> Option<Self> {
        Self::for_host_in(std::env::consts::ARCH, &paths::firmware_search_dirs())
    }

    pub fn firmware_vars_path(&self) -> &Path {
        Path::new(&self.firmware_vars)
    }

    pub fn to_hardware_model(&self) -> Result<HardwareModel, String> {
        facet_json::to_string(self)
            .map(|json| HardwareModel::from_bytes(json.into_bytes()))
            .map_err(|e| format!("serializing hardware model: {e}"))
    }

    pub fn from_hardware_model(model: &HardwareModel) -> Result<Self, String> {
        let text = std::str::from_utf8(model.as_bytes())
            .map_err(|_| "hardware model is not UTF-8".to_string())?;
        facet_json::from_str(text).map_err(|e| format!("hardware model is not understood: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_firmware_pair() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("OVMF_CODE_4M.fd"), b"code").unwrap();
        std::fs::write(dir.path().join("OVMF_VARS_4M.fd"), b"vars").unwrap();
        std::fs::write(dir.path().join("OVMF_CODE.fd"), b"code").unwrap();

        let found =
            PlatformDescriptor::for_host_in("x86_64", &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(found.machine, "q35");
        assert!(found.firmware_code.ends_with("OVMF_CODE_4M.fd"));
        assert!(found.firmware_vars.ends_with("OVMF_VARS_4M.fd"));
    }

    #[test]
    fn missing_firmware_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PlatformDescriptor::for_host_in("x86_64", &[dir.path().to_path_buf()]).is_none());
    }

    #[test]
    fn survives_hardware_model_bytes() {
        let descriptor = PlatformDescriptor {
            arch: "aarch64".into(),
            machine: "virt".into(),
            firmware_code: "/fw/code.raw".into(),
            firmware_vars: "/fw/vars.raw".into(),
        };
        let model = descriptor.to_hardware_model().unwrap();
        assert!(std::str::from_utf8(model.as_bytes()).unwrap().contains("\"firmwareCode\""));
        assert_eq!(PlatformDescriptor::from_hardware_model(&model).unwrap(), descriptor);
    }

    #[test]
    fn foreign_model_is_rejected() {
        let model = HardwareModel::from_bytes(vec![0xff, 0x00, 0x12]);
        assert!(PlatformDescriptor::from_hardware_model(&model).is_err());
    }
}
