use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Logger fanning records out to the configured targets, each with its own
/// optional level threshold.
pub struct CustomLogger {
    level: LevelFilter,
    format: LogFormat,
    sinks: Vec<(LevelFilter, Mutex<BufWriter<Box<dyn Write + Send>>>)>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let level = config.level.unwrap_or_default().to_level_filter();
        let format = config.format.unwrap_or_default();

        let mut sinks = Vec::new();
        for target in config.targets.unwrap_or_default() {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or("File output type requires path")?;
                    Box::new(OpenOptions::new().create(true).append(true).open(path)?)
                }
            };
            sinks.push((target_filter(&target, level), Mutex::new(BufWriter::new(writer))));
        }

        Ok(Self { level, format, sinks })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        // The global filter is the loosest threshold among the sinks
        let max = logger.sinks.iter().map(|(filter, _)| *filter).max().unwrap_or(logger.level);
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max);
        Ok(())
    }

    fn render(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => format_text(record),
            LogFormat::Json => format_json(record),
        }
    }
}

fn target_filter(target: &LogTarget, fallback: LevelFilter) -> LevelFilter {
    target.level.as_ref().map(LogLevel::to_level_filter).unwrap_or(fallback)
}

fn format_text(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    format!(
        "{} [{}] [{}] {}",
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().as_str().to_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    })
    .to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sinks.iter().any(|(filter, _)| metadata.level() <= *filter)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = self.render(record);
        for (filter, writer) in &self.sinks {
            if record.level() <= *filter {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", line);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for (_, writer) in &self.sinks {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// env_logger based setup used when the config file has no logging section.
/// `RUST_LOG` still overrides the level.
pub fn init_fallback(log_level: Option<&str>, log_format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let level = log_level.unwrap_or("info");
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if log_format == Some("json") {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }

    builder.try_init()?;
    Ok(())
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log};

    fn file_config(path: std::path::PathBuf, format: LogFormat, target_level: Option<LogLevel>) -> LoggingConfig {
        LoggingConfig {
            level: Some(LogLevel::Info),
            format: Some(format),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: Some(path),
                level: target_level,
            }]),
        }
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_log_level("WARN").unwrap(), LogLevel::Warn);
        assert!(parse_log_level("verbose").is_err());
        assert_eq!(parse_log_format("Json").unwrap(), LogFormat::Json);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_file_target_respects_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devgate.log");
        let logger = CustomLogger::new(file_config(path.clone(), LogFormat::Text, Some(LogLevel::Warn))).unwrap();

        assert!(!logger.enabled(&Metadata::builder().level(Level::Info).build()));
        assert!(logger.enabled(&Metadata::builder().level(Level::Error).build()));

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("devgate")
                .args(format_args!("dropped"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("devgate")
                .args(format_args!("build failed"))
                .build(),
        );
        logger.flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[WARN] [devgate] build failed"));
        assert!(!written.contains("dropped"));
    }

    #[test]
    fn test_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devgate.json.log");
        let logger = CustomLogger::new(file_config(path.clone(), LogFormat::Json, None)).unwrap();

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("devgate::proxy")
                .args(format_args!("listening"))
                .build(),
        );

        let written = std::fs::read_to_string(&path).unwrap();
        let entry: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(entry["level"], "info");
        assert_eq!(entry["target"], "devgate::proxy");
        assert_eq!(entry["message"], "listening");
    }

    #[test]
    fn test_file_target_requires_path() {
        let config = LoggingConfig {
            level: None,
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        };
        assert!(CustomLogger::new(config).is_err());
    }
}
