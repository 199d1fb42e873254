use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing_appender::non_blocking;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
pub enum LogMode {
    /// Console-only logging
    Console,
    /// Console + per-session file logging
    ConsoleAndFile(PathBuf),
}

pub struct LoggingConfig {
    pub mode: LogMode,
    pub session_id: String,
}

impl LoggingConfig {
    pub fn new(mode: LogMode) -> Self {
        let session_id = generate_session_id();
        Self { mode, session_id }
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        match &self.mode {
            LogMode::Console => None,
            LogMode::ConsoleAndFile(dir) => {
                Some(dir.join(format!("quotelink-{}.log", self.session_id)))
            }
        }
    }
}

/// Initialize logging based on the configuration
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    // Get log level from environment or default to INFO
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.mode {
        LogMode::Console => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .init();
        }
        LogMode::ConsoleAndFile(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join(format!("quotelink-{}.log", config.session_id));
            let log_file = std::fs::File::create(&log_path)
                .map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

            let (file_writer, _file_guard) = non_blocking(log_file);

            // Store the guard to prevent it from being dropped
            std::mem::forget(_file_guard);

            use tracing_subscriber::fmt::writer::MakeWriterExt;
            let multi_writer = std::io::stderr.and(file_writer);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(multi_writer)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .init();
        }
    }

    tracing::info!(
        session_id = %config.session_id,
        mode = ?config.mode,
        "Logging initialized"
    );

    Ok(())
}

/// Generate a unique session ID with timestamp
fn generate_session_id() -> String {
    let now: DateTime<Utc> = Utc::now();
    format!("{}", now.format("%Y%m%d_%H%M%S_%3f"))
}
