use std::sync::Mutex;

use camino::Utf8Path;
use tracing_subscriber::filter::{LevelFilter, filter_fn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use idc_etl::{run_etl, settings_from_env};

fn main() -> anyhow::Result<()> {
    let settings = settings_from_env()?;
    init_logging(settings.log_dir.as_deref())?;
    let root = run_etl(&settings)?;
    tracing::info!(
        version = settings.version,
        collections = root.children.len(),
        "done"
    );
    Ok(())
}

/// Log to stdout, filtered by `RUST_LOG`. With a log directory, also append progress
/// events to `progress.log` and errors to `error.log`.
fn init_logging(log_dir: Option<&Utf8Path>) -> anyhow::Result<()> {
    let stdout = tracing_subscriber::fmt::layer()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    let (progress, errors) = match log_dir {
        Some(dir) => {
            fs_err::create_dir_all(dir)?;
            let progress = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(append(&dir.join("progress.log"))?))
                .with_filter(filter_fn(|meta| meta.target() == "idc_etl::progress"));
            let errors = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(append(&dir.join("error.log"))?))
                .with_filter(LevelFilter::ERROR);
            (Some(progress), Some(errors))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(stdout)
        .with(progress)
        .with(errors)
        .try_init()?;
    Ok(())
}

fn append(path: &Utf8Path) -> std::io::Result<fs_err::File> {
    fs_err::OpenOptions::new().create(true).append(true).open(path)
}
