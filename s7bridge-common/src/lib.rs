//! S7 Bridge Common Library
//!
//! Shared plumbing for the S7 Zenoh bridge:
//!
//! - [`config`] - Zenoh and logging configuration, JSON5 loading
//! - [`session`] - Zenoh session management
//! - [`keyexpr`] - Key expressions for the command, response and status channels
//! - [`status`] - Bridge lifecycle status document
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod keyexpr;
pub mod session;
pub mod status;

pub use config::{LogFormat, LoggingConfig, ZenohConfig, ZenohMode, load_config, parse_config};
pub use error::{Error, Result};
pub use keyexpr::{BridgeKeys, KEY_PREFIX, validate_prefix};
pub use session::connect;
pub use status::{BridgeStatus, Lifecycle};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use s7bridge_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    }
    .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
