use chrono::Local;
use env_logger::{Builder, Env};
use log::{error, info, warn, LevelFilter};
use std::env;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

const LEVEL_VAR: &str = "LOG_LEVEL";

/// Initialize the logging system.
///
/// `LOG_LEVEL` in the environment fixes the filter for the whole run.
/// Without it records pass at `info` until [`set_level`] applies the
/// configured level. When `LOG_FILE` is set, records go to that file as well
/// as stdout.
pub fn init_logger() {
    INIT.call_once(|| {
        let from_env = env::var(LEVEL_VAR).is_ok();
        let mut builder = Builder::from_env(Env::default().filter(LEVEL_VAR));
        if !from_env {
            builder.filter_level(LevelFilter::Trace);
        }
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

        let log_file = env::var("LOG_FILE").ok();
        let mut open_error = None;
        if let Some(path) = &log_file {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(FileAndStdout { file })));
                }
                Err(e) => open_error = Some(e),
            }
        }
        builder.init();
        if !from_env {
            log::set_max_level(LevelFilter::Info);
        }

        match (log_file, open_error) {
            (Some(path), Some(e)) => {
                error!("Failed to open log file {}, logging to stdout only: {}", path, e)
            }
            (Some(path), None) => info!("Logging to {}", path),
            (None, _) => {}
        }
    });
}

/// Apply the configured level. `LOG_LEVEL` in the environment wins.
pub fn set_level(level: &str) {
    if env::var(LEVEL_VAR).is_ok() {
        return;
    }
    match level.parse::<LevelFilter>() {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("Ignoring invalid log level: {}", level),
    }
}

/// Custom writer that writes to both a file and stdout
struct FileAndStdout {
    file: File,
}

impl Write for FileAndStdout {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_applies_after_init() {
        init_logger();
        if env::var(LEVEL_VAR).is_ok() {
            return;
        }

        set_level("debug");
        assert_eq!(log::max_level(), LevelFilter::Debug);

        set_level("loud");
        assert_eq!(log::max_level(), LevelFilter::Debug);

        set_level("warn");
        assert_eq!(log::max_level(), LevelFilter::Warn);
    }
}
