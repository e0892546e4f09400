pub mod builder;
pub mod common;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod gate;
pub mod hijack;
pub mod logging;
pub mod proxy;
pub mod reverse_proxy;
pub mod runner;
pub mod splice;
pub mod upgrade;
pub mod upstream;
pub mod watcher;

pub use config::Config;
pub use error::ProxyError;
pub use gate::{Builder, Runner};
pub use proxy::Proxy;
