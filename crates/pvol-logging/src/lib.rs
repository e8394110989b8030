//! Logging setup for the pooled-volume stack.
//!
//! Hosts embed [`LogConfig`] in their configuration file (the `[log]`
//! section of a pvol config, see `pvol-config`) and call [`init_logging`]
//! once at startup, before constructing the registry. Output goes to the
//! console and optionally to a rolling file under `log_dir`; the returned
//! guard must stay alive for as long as the process logs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

pub use tracing::{debug, error, info, warn};

/// Rotation policy for the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level filter. `RUST_LOG` overrides it when set.
    pub level: String,

    /// Directory for rolling log files; console-only when absent.
    pub log_dir: Option<PathBuf>,

    /// File name prefix for the rolling log.
    pub file_prefix: String,

    pub rotation: Rotation,

    /// Emit JSON lines instead of the human-readable format.
    pub json_format: bool,

    /// Also write to stdout.
    pub console_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
            log_dir: None,
            file_prefix: "pvol".into(),
            rotation: Rotation::default(),
            json_format: false,
            console_output: true,
        }
    }
}

fn fmt_layer<S, W>(json: bool, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        Box::new(fmt::layer().json().with_writer(writer))
    } else {
        Box::new(fmt::layer().with_writer(writer))
    }
}

/// Install the global subscriber. Call once at startup; holds the file
/// writer's worker alive through the returned guard.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console = config
        .console_output
        .then(|| fmt_layer(config.json_format, std::io::stdout));

    let (file, guard) = match &config.log_dir {
        Some(log_dir) => {
            let appender = rolling::RollingFileAppender::builder()
                .rotation(config.rotation.into())
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(log_dir)
                .expect("failed to create rolling file appender");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt_layer(config.json_format, writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, "pvol");
        assert_eq!(config.rotation, Rotation::Daily);
        assert!(config.console_output);
        assert!(!config.json_format);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.rotation, Rotation::Daily);

        let config: LogConfig =
            serde_json::from_str(r#"{"level":"debug","rotation":"hourly"}"#).unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.rotation, Rotation::Hourly);
    }

    #[test]
    fn test_rotation_names() {
        for (name, rotation) in [
            ("hourly", Rotation::Hourly),
            ("daily", Rotation::Daily),
            ("never", Rotation::Never),
        ] {
            let parsed: Rotation = serde_json::from_str(&format!("\"{}\"", name)).unwrap();
            assert_eq!(parsed, rotation);
            assert_eq!(serde_json::to_string(&rotation).unwrap(), format!("\"{}\"", name));
        }
    }
}
