use clap::Parser;
use devgate::builder::CommandBuilder;
use devgate::config::Config;
use devgate::config_validation::ConfigValidator;
use devgate::logging::{init_fallback, parse_log_format, parse_log_level, CustomLogger};
use devgate::runner::ProcessRunner;
use devgate::watcher::Watcher;
use devgate::Proxy;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Development proxy that holds requests until the backend builds, then forwards them"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "HOST", help = "Listen host (default: 127.0.0.1)")]
    laddr: Option<String>,

    #[clap(short, long, value_name = "PORT", help = "Listen port")]
    port: Option<u16>,

    #[clap(long, value_name = "URL", help = "Backend URL requests are proxied to (e.g., http://localhost:3001)")]
    proxy_to: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    cert_file: Option<String>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    key_file: Option<String>,

    #[clap(long, value_name = "CMD", help = "Build command, e.g. \"go build -o app\"")]
    build: Option<String>,

    #[clap(long, value_name = "CMD", help = "Command that starts the backend, e.g. \"./app\"")]
    run: Option<String>,

    #[clap(long, value_name = "PATH", help = "Path to watch for changes (can be used multiple times)")]
    watch: Vec<PathBuf>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                return Err(format!("Configuration file not found: {}", config_file).into());
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };
    apply_args(&mut config, &args)?;
    init_logging(&config, &args)?;

    let validation = ConfigValidator::validate(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("{}", suggestion);
    }
    if !validation.is_valid {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err(format!("Invalid configuration: {}", validation.errors.join("; ")).into());
    }

    let target = config.backend_target()?;
    let builder = Arc::new(CommandBuilder::new(config.build.clone()));
    let runner = Arc::new(ProcessRunner::new(config.run.clone()).with_backend_port(target.port()));

    // A failed first build is served to clients, not fatal
    let initial = Arc::clone(&builder);
    tokio::task::spawn_blocking(move || initial.build()).await?;

    let mut proxy = Proxy::new(builder.clone(), runner.clone());
    proxy.run(&config).await?;

    let watcher = Watcher::new(config.watch.clone())?;
    let watch_task = tokio::spawn(watch_loop(watcher, builder, Arc::clone(&runner)));

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    watch_task.abort();
    proxy.close();
    runner.kill();

    info!("Proxy stopped");
    Ok(())
}

/// CLI flags take precedence over the configuration file.
fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(laddr) = &args.laddr {
        config.laddr = Some(laddr.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(proxy_to) = &args.proxy_to {
        config.proxy_to = proxy_to.clone();
    }
    if let Some(cert_file) = &args.cert_file {
        config.cert_file = Some(cert_file.clone());
    }
    if let Some(key_file) = &args.key_file {
        config.key_file = Some(key_file.clone());
    }
    if let Some(build) = &args.build {
        let (command, rest) = split_command("--build", build)?;
        config.build.command = Some(command);
        config.build.args = rest;
    }
    if let Some(run) = &args.run {
        let (command, rest) = split_command("--run", run)?;
        config.run.command = command;
        config.run.args = rest;
    }
    if !args.watch.is_empty() {
        config.watch.paths = args.watch.clone();
    }

    if let Some(logging) = config.logging.as_mut() {
        if let Some(level) = &args.log_level {
            logging.level = Some(parse_log_level(level)?);
        }
        if let Some(format) = &args.log_format {
            logging.format = Some(parse_log_format(format)?);
        }
    }
    Ok(())
}

/// Split a command line with shell quoting rules, without invoking a shell.
fn split_command(flag: &str, line: &str) -> Result<(String, Vec<String>), Box<dyn std::error::Error>> {
    let mut words = shell_words::split(line)
        .map_err(|e| format!("{} {:?}: {}", flag, line, e))?
        .into_iter();
    let command = words.next().ok_or_else(|| format!("{} needs a command", flag))?;
    Ok((command, words.collect()))
}

fn init_logging(config: &Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &config.logging {
        Some(logging) => CustomLogger::init(logging.clone()),
        None => init_fallback(args.log_level.as_deref(), args.log_format.as_deref()),
    }
}

/// Rebuild on source changes. A successful build marks the backend stale so
/// the next admitted request restarts it.
async fn watch_loop(mut watcher: Watcher, builder: Arc<CommandBuilder>, runner: Arc<ProcessRunner>) {
    while watcher.changed().await {
        let build = Arc::clone(&builder);
        match tokio::task::spawn_blocking(move || build.build()).await {
            Ok(true) => runner.invalidate(),
            Ok(false) => {}
            Err(e) => warn!("Build task failed: {}", e),
        }
    }
    warn!("Source watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_keeps_quoted_arguments() {
        let (command, args) = split_command("--build", "go build -ldflags '-X main.v=1' -o app").unwrap();
        assert_eq!(command, "go");
        assert_eq!(args, vec!["build", "-ldflags", "-X main.v=1", "-o", "app"]);
    }

    #[test]
    fn test_split_command_rejects_bad_input() {
        assert!(split_command("--run", "   ").is_err());
        assert!(split_command("--run", "./app \"unterminated").is_err());
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let args = Args::parse_from(["devgate", "--port", "4000", "--run", "./server --verbose", "--watch", "src"]);
        let mut config = Config::default();
        apply_args(&mut config, &args).unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.run.command, "./server");
        assert_eq!(config.run.args, vec!["--verbose"]);
        assert_eq!(config.watch.paths, vec![PathBuf::from("src")]);
    }
}
