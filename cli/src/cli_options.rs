use clap::{Parser, ValueEnum};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl LogLevel {
    /// Maps a `Log.Level` value. `panic` and `fatal` have no tracing
    /// counterpart and log at error level.
    pub fn from_config(level: &str) -> Option<Self> {
        match level.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "fatal" | "panic" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "RonDB REST and gRPC data access server", long_about = None)]
pub struct CliOptions {
    /// Path to the JSON configuration file.
    /// Can also be set via the RDRS_CONFIG_FILE environment variable.
    #[arg(short = 'c', long = "config", default_value = None)]
    pub config: Option<String>,
    /// The logging level. Case-insensitive. Overrides `Log.Level` of the configuration file.
    #[arg(value_enum, long = "log-level", ignore_case = true, default_value = None)]
    pub log_level: Option<LogLevel>,
    /// Disable the /metrics endpoint of the REST server.
    #[arg(long = "no-metrics", default_value_t = false)]
    pub no_metrics: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_levels_map_to_tracing_levels() {
        assert_eq!(LogLevel::from_config("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config("panic"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_config("verbose"), None);
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
    }

    #[test]
    fn flags_parse() {
        let opts =
            CliOptions::try_parse_from(["rdrs", "--config", "/etc/rdrs.json", "--log-level", "DEBUG"])
                .unwrap();
        assert_eq!(opts.config.as_deref(), Some("/etc/rdrs.json"));
        assert_eq!(opts.log_level, Some(LogLevel::Debug));
        assert!(!opts.no_metrics);
    }
}
