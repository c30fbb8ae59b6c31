use std::path::PathBuf;

use thiserror::Error;

use crate::authorizer::AuthorizationDenied;

/// Error surface for registration, authorization, the bus client and activation files.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("name in use: {name}")]
    NameInUse { name: String },

    #[error("object path already occupied: {path}")]
    PublishFailure { path: String },

    #[error(transparent)]
    AuthorizationDenied(#[from] AuthorizationDenied),

    #[error("bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("config error: {0}")]
    Config(#[from] balancer_core::ConfigError),

    #[error("engine error: {0}")]
    Engine(#[from] balancer_engine::EngineError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("service runtime error: {0}")]
    Runtime(String),
}

impl From<zbus::fdo::Error> for ServiceError {
    fn from(err: zbus::fdo::Error) -> Self {
        ServiceError::Bus(zbus::Error::from(err))
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ServiceError {
    ServiceError::Io {
        path: path.into(),
        source,
    }
}
