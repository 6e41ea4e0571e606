//! Configuration Module
//!
//! Configuration loading for the quote stream client.

mod settings;

pub use settings::{ClientConfig, CollaboratorSettings, ConfigError, ServerSettings, StreamSettings};
