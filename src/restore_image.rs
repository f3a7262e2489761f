use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressDrawTarget};
use tokio::io::AsyncWriteExt;

use crate::error::VmctlError;
use crate::progress::{self, OutputMode};

pub fn is_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Cache file name for a restore image URL (last path segment, no query).
pub fn cache_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("restore-image.iso")
        .to_string()
}

/// Turn a restore-image reference into a local file.
///
/// Local paths must exist. URLs are downloaded once into `cache_dir`; a
/// cached copy is reused on later calls.
pub async fn ensure_restore_image(
    reference: &str,
    cache_dir: &Path,
    mode: OutputMode,
) -> Result<PathBuf, VmctlError> {
    if !is_url(reference) {
        let path = PathBuf::from(reference);
        if !path.is_file() {
            return Err(VmctlError::Io {
                context: format!("restore image not found: {}", path.display()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        return Ok(path);
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| VmctlError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(cache_file_name(reference));
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached restore image");
        return Ok(dest);
    }

    tracing::info!(url = %reference, "downloading restore image");
    let response = reqwest::get(reference)
        .await
        .map_err(|e| VmctlError::Download {
            message: format!("request to {reference} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(VmctlError::Download {
            message: format!("HTTP {} from {reference}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    if mode == OutputMode::Plain {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_style(progress::download_style());
    }

    let part = part_path(&dest);
    let _ = tokio::fs::remove_file(&part).await;

    if let Err(e) = download_to_file(&part, response, &pb).await {
        let _ = tokio::fs::remove_file(&part).await;
        pb.abandon();
        return Err(e);
    }

    tokio::fs::rename(&part, &dest)
        .await
        .map_err(|e| VmctlError::Io {
            context: format!("renaming {} to {}", part.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "restore image cached");
    Ok(dest)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), VmctlError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VmctlError::Io {
            context: format!("creating {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VmctlError::Download {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| VmctlError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| VmctlError::Io {
        context: format!("flushing {}", path.display()),
        source: e,
    })
}
