use std::path::{Path, PathBuf};

use crate::engine::{Engine, HardwareModel, MachineIdentifier, Platform};
use crate::error::VmctlError;

pub const DISK_IMAGE: &str = "disk.img";
pub const AUX_STORAGE: &str = "aux.img";
pub const HARDWARE_MODEL: &str = "model.dat";
pub const MACHINE_IDENTIFIER: &str = "identifier.dat";

/// Every file a complete bundle holds.
pub const ARTIFACTS: [&str; 4] = [DISK_IMAGE, AUX_STORAGE, HARDWARE_MODEL, MACHINE_IDENTIFIER];

const MIB: u64 = 1024 * 1024;

/// A VM's durable state: one directory with four fixed artifacts.
///
/// `model.dat` and `identifier.dat` are written once by [`VmBundle::setup`]
/// and never rewritten afterwards; the engine identifies the VM by them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmBundle {
    root: PathBuf,
}

impl VmBundle {
    /// Refer to an existing bundle directory without touching the disk.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { root: path.into() }
    }

    /// Ensure the bundle directory exists, creating parents as needed.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, VmctlError> {
        let root = path.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| VmctlError::bundle_io(format!("creating {}", root.display()), e))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory name of the bundle, used to label logs and domains.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vm".into())
    }

    pub fn disk_image(&self) -> PathBuf {
        self.root.join(DISK_IMAGE)
    }

    pub fn aux_storage(&self) -> PathBuf {
        self.root.join(AUX_STORAGE)
    }

    pub fn hardware_model_path(&self) -> PathBuf {
        self.root.join(HARDWARE_MODEL)
    }

    pub fn machine_identifier_path(&self) -> PathBuf {
        self.root.join(MACHINE_IDENTIFIER)
    }

    /// Populate a fresh bundle for `model`.
    ///
    /// The disk image is sized with `set_len`, so it is sparse where the
    /// filesystem allows. Nothing is rolled back if a later step fails.
    pub async fn setup(
        &self,
        engine: &dyn Engine,
        model: &HardwareModel,
        disk_size_mb: u64,
    ) -> Result<(), VmctlError> {
        let disk = self.disk_image();
        let disk_size = disk_size_mb.checked_mul(MIB).ok_or_else(|| {
            VmctlError::InvalidConfiguration {
                constraint: format!("disk size {disk_size_mb} MB is too large"),
            }
        })?;
        let file = tokio::fs::File::create(&disk)
            .await
            .map_err(|e| VmctlError::bundle_io(format!("creating {}", disk.display()), e))?;
        file.set_len(disk_size)
            .await
            .map_err(|e| VmctlError::bundle_io(format!("sizing {}", disk.display()), e))?;
        drop(file);

        let aux = self.aux_storage();
        engine
            .create_aux_storage(&aux, model)
            .map_err(|e| VmctlError::bundle_io(format!("creating {}", aux.display()), e))?;

        write_blob(&self.hardware_model_path(), model.as_bytes()).await?;

        let identifier = engine.new_machine_identifier();
        write_blob(&self.machine_identifier_path(), identifier.as_bytes()).await?;

        tracing::info!(
            bundle = %self.root.display(),
            disk_size_mb,
            "bundle set up"
        );
        Ok(())
    }

    pub fn hardware_model(&self) -> Result<HardwareModel, VmctlError> {
        read_blob(&self.hardware_model_path()).map(HardwareModel::from_bytes)
    }

    pub fn machine_identifier(&self) -> Result<MachineIdentifier, VmctlError> {
        read_blob(&self.machine_identifier_path()).map(MachineIdentifier::from_bytes)
    }

    /// Platform identity as persisted in this bundle.
    pub fn platform(&self) -> Result<Platform, VmctlError> {
        Ok(Platform {
            aux_storage: self.aux_storage(),
            hardware_model: self.hardware_model()?,
            machine_identifier: self.machine_identifier()?,
        })
    }

    /// Byte-copy this bundle to `target`, replacing whatever was there.
    ///
    /// A failure partway leaves a partial bundle at `target`.
    pub async fn clone_to(&self, target: impl Into<PathBuf>) -> Result<VmBundle, VmctlError> {
        let target = target.into();

        if overlaps(&self.root, &target) {
            return Err(VmctlError::bundle_io(
                format!(
                    "cloning {} to {}",
                    self.root.display(),
                    target.display()
                ),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "source and target must not contain each other",
                ),
            ));
        }

        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => tracing::debug!(path = %target.display(), "removed previous clone target"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VmctlError::bundle_io(
                    format!("removing {}", target.display()),
                    e,
                ));
            }
        }

        let clone = VmBundle::create(target).await?;
        for artifact in ARTIFACTS {
            let from = self.root.join(artifact);
            let to = clone.root.join(artifact);
            tokio::fs::copy(&from, &to).await.map_err(|e| {
                VmctlError::bundle_io(
                    format!("copying {} to {}", from.display(), to.display()),
                    e,
                )
            })?;
        }

        tracing::info!(
            from = %self.root.display(),
            to = %clone.root.display(),
            "bundle cloned"
        );
        Ok(clone)
    }
}

/// True when one path is, or lies inside, the other. Replacing such a
/// target would delete or nest into the source.
fn overlaps(source: &Path, target: &Path) -> bool {
    let source = std::fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
    let target = canonical_target(target);
    source.starts_with(&target) || target.starts_with(&source)
}

/// Canonical form of a path that may not exist yet: its nearest existing
/// ancestor is canonicalized and the missing tail re-appended.
fn canonical_target(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(canonical) = std::fs::canonicalize(current) {
            return missing.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

async fn write_blob(path: &Path, bytes: &[u8]) -> Result<(), VmctlError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| VmctlError::bundle_io(format!("writing {}", path.display()), e))
}

fn read_blob(path: &Path) -> Result<Vec<u8>, VmctlError> {
    std::fs::read(path).map_err(|e| VmctlError::bundle_io(format!("reading {}", path.display()), e))
}
