use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

/// Env var that overrides the filter of the log file layer.
pub const WRITE_RUST_LOG: &str = "WRITE_RUST_LOG";

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log file path (optional)
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Install the configured layers as the global subscriber.
    ///
    /// Console and json output go to stderr; stdout is left to the program.
    pub fn init(self) -> anyhow::Result<()> {
        let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

        match self.output {
            LogOutput::Console => layers.push(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(output_logs_filter(self.level)?)
                    .boxed(),
            ),
            LogOutput::Json => layers.push(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_filter(output_logs_filter(self.level)?)
                    .boxed(),
            ),
            LogOutput::None => {}
        }

        if let Some(log_file_path) = self.write_logs_file {
            let log_file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_file_path)?;

            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_filter(detailed_logs_filter(self.level)?)
                    .boxed(),
            );
        }

        let subscriber = tracing_subscriber::registry().with(layers);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

// exclude tokio traces from regular output
fn output_logs_filter(level: Level) -> anyhow::Result<EnvFilter> {
    quiet_runtime(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?,
    )
}

fn detailed_logs_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let filter = if std::env::var(WRITE_RUST_LOG).is_ok() {
        EnvFilter::builder()
            .with_env_var(WRITE_RUST_LOG)
            .from_env()?
    } else {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?
    };
    quiet_runtime(filter)
}

fn quiet_runtime(filter: EnvFilter) -> anyhow::Result<EnvFilter> {
    Ok(filter
        .add_directive("tokio=off".parse()?)
        .add_directive("runtime=off".parse()?))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_output_parses_from_cli_names() {
        assert_eq!(LogOutput::from_str("console", true), Ok(LogOutput::Console));
        assert_eq!(LogOutput::from_str("json", true), Ok(LogOutput::Json));
        assert_eq!(LogOutput::from_str("none", true), Ok(LogOutput::None));
        assert!(LogOutput::from_str("tui", true).is_err());
    }

    #[test]
    fn test_filters_silence_runtime_targets() {
        let filter = output_logs_filter(Level::DEBUG).unwrap().to_string();
        assert!(filter.contains("tokio=off"), "{filter}");
        assert!(filter.contains("runtime=off"), "{filter}");
    }

    #[test]
    fn test_builder_defaults() {
        let builder = logging();
        assert_eq!(builder.output, LogOutput::Console);
        assert_eq!(builder.level, Level::INFO);
        assert!(builder.write_logs_file.is_none());

        let builder = builder
            .with_output(LogOutput::Json)
            .with_level(Level::WARN)
            .with_log_file(PathBuf::from("spmd.log"));
        assert_eq!(builder.output, LogOutput::Json);
        assert_eq!(builder.level, Level::WARN);
        assert_eq!(builder.write_logs_file, Some(PathBuf::from("spmd.log")));
    }
}
