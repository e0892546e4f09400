//! Startup validation of the merged configuration.
//!
//! Errors stop the proxy before it binds; warnings and suggestions are only
//! logged.

use crate::config::Config;
use crate::upstream::BackendTarget;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::success();

        let target = Self::validate_target(config, &mut result);
        Self::validate_listen(config, target.as_ref(), &mut result);
        Self::validate_tls(config, &mut result);
        Self::validate_commands(config, &mut result);

        if config.connect_timeout_secs == 0 {
            result.add_warning("connect_timeout_secs is 0; backend connects fail immediately".to_string());
        }

        result
    }

    fn validate_target(config: &Config, result: &mut ValidationResult) -> Option<BackendTarget> {
        match config.backend_target() {
            Ok(target) => Some(target),
            Err(e) => {
                result.add_error(format!("proxy_to {:?} is not usable: {}", config.proxy_to, e));
                None
            }
        }
    }

    fn validate_listen(config: &Config, target: Option<&BackendTarget>, result: &mut ValidationResult) {
        let host = config.listen_host();
        if !is_loopback_host(host) {
            result.add_warning(format!(
                "Listening on {} exposes the development proxy to the network",
                host
            ));
            result.add_suggestion(format!("Omit laddr to listen on {} only", crate::config::DEFAULT_LADDR));
        }

        if let Err(e) = config.listen_addr() {
            result.add_error(e.to_string());
        }

        // The proxy would forward to itself
        if let Some(target) = target {
            if target.port() == config.port && is_loopback_host(host) && is_loopback_host(target.host()) {
                result.add_error(format!(
                    "Listen port {} is the backend port of {}",
                    config.port, target
                ));
                result.add_suggestion("Run the backend on a different port than the proxy".to_string());
            }
        }
    }

    fn validate_tls(config: &Config, result: &mut ValidationResult) {
        let has_cert = config.cert_file.as_deref().is_some_and(|c| !c.is_empty());
        let has_key = config.key_file.as_deref().is_some_and(|k| !k.is_empty());
        if has_cert != has_key {
            result.add_error("cert_file and key_file must be configured together".to_string());
        }
    }

    fn validate_commands(config: &Config, result: &mut ValidationResult) {
        if config.run.command.trim().is_empty() {
            result.add_error("run.command must not be empty".to_string());
        }
        if config.build.command.is_none() {
            result.add_suggestion("No build command configured; requests are never gated on a build".to_string());
        }
    }
}

fn is_loopback_host(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.eq_ignore_ascii_case("localhost")
        || bare.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
