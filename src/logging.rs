use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::fmt::MakeWriter;

use crate::bundle::VmBundle;

/// A `MakeWriter` that drops everything until a file is attached.
///
/// The subscriber is installed before the bundle path is known; once it is,
/// `DeferredFileHandle::set_file` starts appending to the log.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Activation side of a [`DeferredFileWriter`].
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`, creating parent directories.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).is_some()
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Log file for `bundle`: `<parent>/<name>.vmctl.log`.
///
/// Kept beside the bundle, not inside it, so the bundle directory only ever
/// holds its own artifacts.
pub fn bundle_log_path(bundle: &VmBundle) -> PathBuf {
    let root = bundle.path();
    let parent = root.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}.vmctl.log", bundle.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn writes_are_dropped_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"early\n").unwrap();
        assert!(!handle.is_active());

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"late\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "late\n");
    }

    #[test]
    fn log_sits_next_to_bundle() {
        let bundle = VmBundle::open("/vms/fedora");
        assert_eq!(
            bundle_log_path(&bundle),
            PathBuf::from("/vms/fedora.vmctl.log")
        );
    }
}
