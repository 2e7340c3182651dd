//! Console and file tracing setup.

use std::path::Path;

use eyre::WrapErr;
use icalibrate_config::Logging;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::FILE_GUARD;

/// `RUST_LOG`, else `--log-level`, else `[logging].level`, else `info`.
fn filter(cli_level: Option<&str>, cfg: &Logging) -> eyre::Result<EnvFilter> {
    if let Ok(f) = EnvFilter::try_from_default_env() {
        return Ok(f);
    }
    let level = cli_level
        .or(cfg.level.as_deref())
        .unwrap_or("info");
    EnvFilter::try_new(level).wrap_err_with(|| format!("invalid log level {level:?}"))
}

fn rotation(name: Option<&str>) -> Rotation {
    match name {
        Some("daily") => Rotation::DAILY,
        Some("hourly") => Rotation::HOURLY,
        _ => Rotation::NEVER,
    }
}

/// Install the global subscriber. Console output goes to stderr so stdout
/// stays reserved for results.
pub fn init(json: bool, cli_level: Option<&str>, cfg: &Logging) -> eyre::Result<()> {
    let console = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file = match &cfg.file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("logging.file {} has no file name", path.display()))?;
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("create log directory {}", dir.display()))?;
            let appender =
                RollingFileAppender::new(rotation(cfg.rotation.as_deref()), dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter(cli_level, cfg)?)
        .with(console)
        .with(file)
        .try_init()
        .wrap_err("install tracing subscriber")
}
