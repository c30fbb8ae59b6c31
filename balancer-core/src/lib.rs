//! Balancer core library: bus identity, engine vocabulary and configuration.
//!
//! - [`types`]: identity constants, engine status/events, maintenance requests
//! - [`config`]: [`ServiceConfig`] loaded from YAML
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{BusKind, ServiceConfig, DEFAULT_CONFIG_PATH};
pub use error::ConfigError;
pub use types::{
    EngineEvent, EngineStatus, MaintenanceRequest, IDLE_TIMEOUT, INTERFACE_NAME, OBJECT_PATH,
    SERVICE_NAME,
};
