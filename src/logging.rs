//! Tracing setup. stdout carries the LSP stream, so logs go to a file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber: JSON lines appended to the log file,
/// or plain text on stderr if the file can't be opened.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match open_log_file(&config.file) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(Mutex::new(file))
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .with_ansi(false)
                .init();
            tracing::warn!(
                error = %e,
                path = %config.file.display(),
                "could not open log file, logging to stderr"
            );
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("hoon.log");
        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "first").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hoon.log");
        writeln!(open_log_file(&path).unwrap(), "one").unwrap();
        writeln!(open_log_file(&path).unwrap(), "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}
