//! Configuration validation.
//!
//! Semantic checks only; serde already guarantees the shapes.

use crate::config::schema::ServerConfig;

/// Validate a configuration before it is accepted into the system.
pub fn validate(config: &ServerConfig) -> Result<(), String> {
    if config.host.trim().is_empty() {
        return Err("host must not be empty".to_owned());
    }
    if config.port == 0 {
        return Err("port must be greater than zero".to_owned());
    }
    Ok(())
}
