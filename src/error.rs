use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid protocol {0:?}, expected tcp or udp")]
    InvalidProtocol(String),

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("unable to connect to {address:?}: {source}")]
    Connect {
        address: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unable to bind to {address:?}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("log directory not found: {0}")]
    NoLogDirectory(PathBuf),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("invalid offset {content:?} in {path}")]
    InvalidOffset { path: PathBuf, content: String },

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
