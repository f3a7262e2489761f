use std::path::PathBuf;

/// Downloaded restore images: `~/.cache/vmctl/restore-images/`
pub fn restore_image_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmctl")
        .join("restore-images")
}

/// Firmware descriptors and variable templates shipped by the distro.
pub fn firmware_search_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("/usr/share/edk2/ovmf"),
        PathBuf::from("/usr/share/OVMF"),
        PathBuf::from("/usr/share/edk2/aarch64"),
    ]
}
