//! Build step run before the backend is (re)started.

use crate::config::BuildConfig;
use crate::gate::Builder;
use log::{info, warn};
use std::process::Command;
use std::sync::Mutex;

/// Runs the configured build command and keeps the output of the last failed
/// build as the error report served to clients.
pub struct CommandBuilder {
    config: BuildConfig,
    report: Mutex<String>,
}

impl CommandBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            report: Mutex::new(String::new()),
        }
    }

    /// Run the build synchronously. Returns true when the build succeeded (or
    /// there is nothing to build).
    pub fn build(&self) -> bool {
        let Some(program) = self.config.command.as_deref() else {
            return true;
        };

        info!("Building: {} {}", program, self.config.args.join(" "));
        let mut command = Command::new(program);
        command.args(&self.config.args);
        if let Some(dir) = &self.config.dir {
            command.current_dir(dir);
        }

        let report = match command.output() {
            Ok(output) if output.status.success() => String::new(),
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                if text.trim().is_empty() {
                    text = format!("Build failed: {}", output.status);
                }
                text
            }
            Err(e) => format!("Failed to run build command {}: {}", program, e),
        };

        let succeeded = report.is_empty();
        if succeeded {
            info!("Build finished successfully");
        } else {
            warn!("Build failed: {}", report.lines().next().unwrap_or_default());
        }

        *self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = report;
        succeeded
    }
}

impl Builder for CommandBuilder {
    fn errors(&self) -> String {
        self.report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
