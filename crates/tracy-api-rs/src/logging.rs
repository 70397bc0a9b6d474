use crate::config::Config;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

const LOG_FILE_NAME: &str = "tracy-api.log";

/// Installs the global subscriber. Events always go to stdout; when the log
/// directory is usable they are appended to `tracy-api.log` there as well,
/// and the returned path names that file.
pub fn init_logging(config: &Config) -> Option<PathBuf> {
    let directive = level_directive(config.debug, std::env::var("TRACY_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let log_file = match open_log_file(Path::new(&config.log_dir)) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let writer = match &log_file {
        Some((_, file)) => BoxMakeWriter::new(io::stdout.and(Arc::clone(file))),
        None => BoxMakeWriter::new(io::stdout),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(log_file.is_none())
        .with_writer(writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    log_file.map(|(path, _)| path)
}

/// `--debug` wins over `TRACY_LOG_LEVEL`; `RUST_LOG` overrides both.
fn level_directive(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn open_log_file(log_dir: &Path) -> io::Result<Option<(PathBuf, Arc<File>)>> {
    if log_dir.as_os_str().is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, Arc::new(file))))
}
