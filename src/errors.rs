use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("transport closed")]
    TransportClosed,
    #[error("frame interpretation failed: {0}")]
    Interpretation(String),
    #[error("timed out waiting for {keywords:?}. received: '{tail}'")]
    Timeout { keywords: Vec<String>, tail: String },
    #[error("command sequence cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
