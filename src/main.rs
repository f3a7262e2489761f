use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vmctl::bundle::VmBundle;
use vmctl::cli::{Cli, Command};
use vmctl::config;
use vmctl::engine::libvirt::LibvirtEngine;
use vmctl::engine::{Engine, StartOptions};
use vmctl::error::VmctlError;
use vmctl::installer::Installer;
use vmctl::instance::{Instance, StopReason};
use vmctl::keyscript::{RunOutcome, RunnerState};
use vmctl::logging;
use vmctl::progress::{InstallProgressView, OutputMode};
use vmctl::restore_image;

const MB_PER_GB: u64 = 1024;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let mode = OutputMode::detect();

    // The install bar owns the terminal in Normal mode; stray log lines on
    // stderr break its redraws.
    let terminal_filter = match (cli.verbose, mode) {
        (true, _) => EnvFilter::new("vmctl=debug"),
        (false, OutputMode::Normal) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"))
        }
        (false, OutputMode::Plain) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmctl=info"))
        }
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: vmctl=debug beside the bundle, discarded until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vmctl=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    if let Some(bundle) = cli.command.bundle() {
        let log = logging::bundle_log_path(&VmBundle::open(bundle));
        if let Err(e) = file_handle.set_file(&log) {
            tracing::warn!(path = %log.display(), error = %e, "file logging disabled");
        }
    }

    let engine = LibvirtEngine::new(cli.connect);

    match cli.command {
        Command::Install {
            config,
            bundle,
            restore_image,
            disk_size_gb,
        } => run_install(&engine, &config, bundle, &restore_image, disk_size_gb, mode).await?,
        Command::Start {
            config,
            bundle,
            key_script,
            recovery,
        } => run_start(&engine, &config, bundle, key_script.as_deref(), recovery).await?,
        Command::Clone { src, dst } => {
            println!("cloning VM to {}...", dst.display());
            VmBundle::open(src).clone_to(dst).await?;
        }
        Command::Ipsw => {
            let url = engine.latest_restore_image().await?;
            println!("{url}");
        }
    }

    Ok(())
}

async fn run_install(
    engine: &LibvirtEngine,
    config_path: &Path,
    bundle_path: PathBuf,
    reference: &str,
    disk_size_gb: u64,
    mode: OutputMode,
) -> Result<(), VmctlError> {
    let bundle = VmBundle::create(bundle_path).await?;
    let config = config::load_config(config_path)?;

    let cache_dir = vmctl::paths::restore_image_cache_dir();
    let image_path = restore_image::ensure_restore_image(reference, &cache_dir, mode).await?;
    let image = engine.load_restore_image(&image_path).await?;

    let disk_size_mb = disk_size_gb
        .checked_mul(MB_PER_GB)
        .ok_or_else(|| VmctlError::InvalidConfiguration {
            constraint: format!("disk size {disk_size_gb} GB is too large"),
        })?;
    bundle
        .setup(engine, &image.hardware_model, disk_size_mb)
        .await?;
    let device_config = config.instantiate(&bundle, engine)?;

    println!("installing {} into {}...", image.path.display(), bundle.path().display());
    let installer = Installer::start(engine, device_config, image)?;
    let view = tokio::spawn(InstallProgressView::new(mode).follow(installer.progress()));

    let result = installer.wait().await;
    let _ = view.await;
    result?;

    println!("install finished.");
    Ok(())
}

async fn run_start(
    engine: &LibvirtEngine,
    config_path: &Path,
    bundle_path: PathBuf,
    key_script: Option<&Path>,
    recovery: bool,
) -> Result<(), VmctlError> {
    let bundle = VmBundle::open(bundle_path);
    let config = config::load_config(config_path)?;
    let device_config = config.instantiate(&bundle, engine)?;
    let domain = engine.domain_name_for(&device_config)?;

    let mut instance = Instance::create(engine, device_config)?;
    if let Some(path) = key_script
        && let Err(e) = instance.load_key_script(path)
    {
        tracing::warn!(error = %e, "key script not attached");
        eprintln!("{e}; starting without a key script");
    }

    println!("starting VM...");
    instance.start(StartOptions { recovery }).await?;

    if config.graphics() {
        open_viewer(engine.uri(), &domain);
    }
    let _console = if config.tty() {
        attach_console(engine.uri(), &domain)
    } else {
        None
    };

    let status = tokio::spawn(print_script_status(instance.script_state()));

    let mut stopped = instance.stopped();
    let reason = loop {
        tokio::select! {
            reason = stopped.wait() => break reason,
            _ = tokio::signal::ctrl_c() => {
                println!("stopping VM...");
                if let Err(e) = instance.request_stop().await {
                    tracing::error!(error = %e, "stop request failed");
                    eprintln!("{e}");
                }
            }
        }
    };
    status.abort();

    match reason {
        StopReason::Halted => {
            println!("VM stopped.");
            Ok(())
        }
        StopReason::Failed(detail) => Err(VmctlError::engine(
            format!("VM stopped with an error: {detail}"),
            format!(
                "see {} for details",
                logging::bundle_log_path(&bundle).display()
            ),
        )),
    }
}

/// Print one line per instruction change until the script ends.
async fn print_script_status(mut state: tokio::sync::watch::Receiver<RunnerState>) {
    let mut last = String::new();
    while state.changed().await.is_ok() {
        let (line, outcome) = {
            let snapshot = state.borrow_and_update();
            (snapshot.status_line(), snapshot.outcome.clone())
        };
        if line != "-" && line != last {
            println!("{line}");
            last = line;
        }
        match outcome {
            None => {}
            Some(RunOutcome::Completed) => {
                println!("key script finished.");
                return;
            }
            Some(RunOutcome::Cancelled { next }) => {
                println!("key script cancelled before #{next}.");
                return;
            }
            Some(RunOutcome::Aborted { index, reason }) => {
                eprintln!("key script aborted at #{index}: {reason}");
                return;
            }
        }
    }
}

/// Best effort: the VM runs fine without a viewer.
fn open_viewer(uri: &str, domain: &str) {
    let spawned = tokio::process::Command::new("virt-viewer")
        .args(["--connect", uri, "--wait", domain])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "could not open virt-viewer");
    }
}

/// Attach the guest serial console to this terminal. The console process
/// is killed when the returned child is dropped.
fn attach_console(uri: &str, domain: &str) -> Option<tokio::process::Child> {
    match tokio::process::Command::new("virsh")
        .args(["-c", uri, "console", "--force", domain])
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => Some(child),
        Err(e) => {
            tracing::warn!(error = %e, "could not attach serial console");
            None
        }
    }
}
