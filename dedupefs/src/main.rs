use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use dedupefs::config::{Args, Config};
use dedupefs::fuse::DedupeFs;
use dedupefs::fuse::mount::mount;
use dedupefs::gdbm::GdbmFile;
use dedupefs::open_snapshot;
use dedupefs::vfs::Snapshot;

const EXIT_USAGE: u8 = 1;
const EXIT_SETUP: u8 = 2;
const EXIT_SERVE: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, snapshot) = match setup(args) {
        Ok(ok) => ok,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    match serve(&config, DedupeFs::new(snapshot).with_ttl(config.ttl)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(EXIT_SERVE)
        }
    }
}

fn setup(args: Args) -> anyhow::Result<(Config, Snapshot<GdbmFile>)> {
    let config = Config::from_args(args)?;
    let snapshot = open_snapshot(&config)?;
    Ok((config, snapshot))
}

async fn serve(config: &Config, fs: DedupeFs<GdbmFile>) -> anyhow::Result<()> {
    let mut mount_handle = mount(fs, &config.mountpoint, &config.mount)
        .await
        .with_context(|| format!("mount on {} failed", config.mountpoint.display()))?;
    tracing::info!(
        mountpoint = %config.mountpoint.display(),
        db = %config.db_path.display(),
        backing = %config.backing_root.display(),
        "mounted"
    );

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("filesystem session ended with an error")?,
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            mount_handle.unmount().await.context("unmount failed")?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
