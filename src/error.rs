use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hyper error: {0}")]
    Hyper(String),

    #[error("Error contacting backend server {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection does not support raw takeover")]
    NotHijackable,

    #[error("Error copying request to backend: {0}")]
    Forward(#[source] std::io::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}
