//! Logging setup and the process-level toggles the runtime consumes.
//!
//! Two flags are recognized on the command line of the host process:
//! `--pier-log=<none|error|warning|info|verbose|debug>` (aliases `warn`,
//! `verb`) and `--debug-tx`, which turns on periodic transaction-table
//! size logging. The env vars `PIER_LOG` and `PIER_DEBUG_TX` act as
//! overrides for hosts that do not forward their argv.

use once_cell::sync::Lazy;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_level: Option<logging::LogLevel>,
    pub debug_tx: bool,
}

static OVERRIDES: Lazy<CliOverrides> = Lazy::new(|| {
    let mut overrides = scan_args(std::env::args().skip(1));
    if let Ok(level) = std::env::var("PIER_LOG") {
        if let Ok(level) = level.parse() {
            overrides.log_level = Some(level);
        }
    }
    if env_truthy("PIER_DEBUG_TX").unwrap_or(false) {
        overrides.debug_tx = true;
    }
    overrides
});

fn scan_args<I: Iterator<Item = String>>(args: I) -> CliOverrides {
    let mut overrides = CliOverrides::default();
    for arg in args {
        if let Some(level) = arg.strip_prefix("--pier-log=") {
            match level.parse() {
                Ok(level) => overrides.log_level = Some(level),
                Err(()) => eprintln!("[pier] unknown log level '{level}', ignoring"),
            }
        } else if arg == "--debug-tx" {
            overrides.debug_tx = true;
        }
    }
    overrides
}

pub fn cli_overrides() -> &'static CliOverrides {
    &OVERRIDES
}

pub fn debug_tx_enabled() -> bool {
    cli_overrides().debug_tx
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        None,
        Error,
        #[value(alias = "warn")]
        Warning,
        #[default]
        Info,
        #[value(alias = "verb")]
        Verbose,
        Debug,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::None => "none",
                LogLevel::Error => "error",
                LogLevel::Warning => "warning",
                LogLevel::Info => "info",
                LogLevel::Verbose => "verbose",
                LogLevel::Debug => "debug",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::None => LevelFilter::OFF,
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warning => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Verbose => LevelFilter::DEBUG,
                LogLevel::Debug => LevelFilter::TRACE,
            }
        }
    }

    impl std::str::FromStr for LogLevel {
        type Err = ();

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "none" => Ok(LogLevel::None),
                "error" => Ok(LogLevel::Error),
                "warning" | "warn" => Ok(LogLevel::Warning),
                "info" => Ok(LogLevel::Info),
                "verbose" | "verb" => Ok(LogLevel::Verbose),
                "debug" => Ok(LogLevel::Debug),
                _ => Err(()),
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

    /// Install the global subscriber. Further calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    /// Initialize with the level taken from the process args / env.
    pub fn init_from_cli() -> Result<(), InitError> {
        let level = super::cli_overrides().log_level.unwrap_or_default();
        init(&LogConfig { level, file: None })
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Verbose)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(Some(guard));
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(filter) = std::env::var("PIER_LOG_FILTER") {
            return EnvFilter::new(filter);
        }
        let base = match level {
            LevelFilter::TRACE => "info,pier=trace",
            LevelFilter::DEBUG => "info,pier=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        EnvFilter::new(base)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn levels_parse_with_aliases() {
            assert_eq!("none".parse(), Ok(LogLevel::None));
            assert_eq!("warning".parse(), Ok(LogLevel::Warning));
            assert_eq!("warn".parse(), Ok(LogLevel::Warning));
            assert_eq!("verbose".parse(), Ok(LogLevel::Verbose));
            assert_eq!("verb".parse(), Ok(LogLevel::Verbose));
            assert_eq!("bogus".parse::<LogLevel>(), Err(()));
        }

        #[test]
        fn levels_map_onto_filters() {
            assert_eq!(LogLevel::None.to_filter(), LevelFilter::OFF);
            assert_eq!(LogLevel::Verbose.to_filter(), LevelFilter::DEBUG);
            assert_eq!(LogLevel::Debug.to_filter(), LevelFilter::TRACE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::logging::LogLevel;
    use super::*;

    #[test]
    fn scan_recognizes_the_two_flags() {
        let overrides = scan_args(
            ["--pier-log=verbose", "--debug-tx", "positional"]
                .iter()
                .map(|s| s.to_string()),
        );
        assert_eq!(overrides.log_level, Some(LogLevel::Verbose));
        assert!(overrides.debug_tx);

        let none = scan_args(std::iter::empty());
        assert!(none.log_level.is_none());
        assert!(!none.debug_tx);
    }
}
