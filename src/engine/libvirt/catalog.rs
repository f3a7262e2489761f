//! Where the newest installable image comes from.

use crate::error::VmctlError;

const RELEASES_URL: &str = "https://www.fedoraproject.org/releases.json";

struct Preset {
    arch: &'static str,
    url: &'static str,
}

/// Used when the release catalog cannot be reached.
const PRESETS: &[Preset] = &[
    Preset {
        arch: "x86_64",
        url: "https://download.fedoraproject.org/pub/fedora/linux/releases/43/Server/x86_64/iso/Fedora-Server-dvd-x86_64-43-1.6.iso",
    },
    Preset {
        arch: "aarch64",
        url: "https://download.fedoraproject.org/pub/fedora/linux/releases/43/Server/aarch64/iso/Fedora-Server-dvd-aarch64-43-1.6.iso",
    },
];

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct FedoraRelease {
    #[facet(default)]
    version: String,
    #[facet(default)]
    arch: String,
    #[facet(default)]
    variant: String,
    #[facet(default)]
    link: String,
}

/// Newest Server DVD for `arch` among `releases`. Pre-releases such as
/// `"44 Beta"` are skipped.
fn select_latest(releases: Vec<FedoraRelease>, arch: &str) -> Option<String> {
    releases
        .into_iter()
        .filter(|r| {
            r.variant == "Server"
                && r.arch == arch
                && r.link.contains("-dvd-")
                && r.link.ends_with(".iso")
        })
        .filter_map(|r| r.version.parse::<u32>().ok().map(|v| (v, r.link)))
        .max_by_key(|(version, _)| *version)
        .map(|(_, link)| link)
}

async fn fetch_releases() -> Result<Vec<FedoraRelease>, VmctlError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| VmctlError::Download {
            message: "building HTTP client".into(),
            source: Box::new(e),
        })?;

    let body = client
        .get(RELEASES_URL)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| VmctlError::Download {
            message: format!("request to {RELEASES_URL} failed"),
            source: Box::new(e),
        })?
        .text()
        .await
        .map_err(|e| VmctlError::Download {
            message: "reading release catalog".into(),
            source: Box::new(e),
        })?;

    facet_json::from_str(&body).map_err(|e| VmctlError::Download {
        message: "release catalog is not valid JSON".into(),
        source: e.to_string().into(),
    })
}

/// URL of the newest installer image for `arch`.
pub async fn latest_restore_image(arch: &str) -> Result<String, VmctlError> {
    match fetch_releases().await {
        Ok(releases) => {
            if let Some(url) = select_latest(releases, arch) {
                return Ok(url);
            }
            tracing::warn!(arch, "release catalog has no server image for this arch");
        }
        Err(e) => tracing::warn!(error = %e, "release catalog unavailable, using preset"),
    }

    PRESETS
        .iter()
        .find(|p| p.arch == arch)
        .map(|p| p.url.to_string())
        .ok_or_else(|| {
            VmctlError::engine(
                format!("no restore image is known for {arch}"),
                "pass a local installer ISO with --restore-image",
            )
        })
}
