use anyhow::{bail, Context, Result};
use bucketail::{init_tracing_once, JsonLinesSink, LocalObjectStore, Poller, PollerOptions, Settings};
use crossbeam_channel::bounded;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

const USAGE: &str = "usage: bucketail <config.json> <object-root>";

fn main() -> Result<()> {
    init_tracing_once();

    let mut args = std::env::args_os().skip(1);
    let (Some(config_path), Some(object_root)) = (args.next(), args.next()) else {
        bail!(USAGE);
    };
    let config_path = PathBuf::from(config_path);
    let object_root = PathBuf::from(object_root);
    if !object_root.is_dir() {
        bail!("object root {} is not a directory\n{USAGE}", object_root.display());
    }

    let opts = PollerOptions::from_json_file(&config_path)?;
    let settings = Settings::from_options(opts).with_context(|| format!("invalid config {}", config_path.display()))?;
    if settings.add_instance_tags {
        bail!("add_instance_tags needs an instance tag directory, which a local object root does not provide");
    }
    if settings.region.is_some() || settings.credentials.is_some() {
        tracing::warn!(
            region = settings.region.as_deref().unwrap_or("-"),
            credentials = ?settings.credentials,
            "region and credentials are ignored when serving a local object root"
        );
    }

    let objects = Arc::new(LocalObjectStore::new(&object_root));
    let sink = Arc::new(JsonLinesSink::new(io::stdout()));
    let poller = Poller::new(settings, objects, sink)?;

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install signal handler")?;

    poller.start()?;
    let _ = stop_rx.recv();
    tracing::info!("signal received, shutting down");
    poller.shutdown()?;
    Ok(())
}
