//! Configuration Module
//!
//! Environment-driven configuration for the recorder.

mod settings;

pub use settings::{
    BinningSettings, ConfigError, QueueSettings, RecorderConfig, ServerSettings, SourceSettings,
    StorageKind, StorageSettings, StorageToken, SupervisorSettings, WebSocketSettings,
    WriterSettings,
};
