//! Configuration for the MIST broker, its services and clients.
//!
//! Configuration is an explicit [`MistConfig`] value built once (from TOML,
//! defaults and a couple of environment overrides) and handed to each
//! component's constructor. All filesystem locations are derived from it
//! through [`Paths`].
//!
//! ```rust,no_run
//! use mist_config::MistConfig;
//!
//! # fn example() -> Result<(), mist_config::ConfigError> {
//! let config = MistConfig::load(None)?;
//! let socket = config.paths().socket_path();
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod paths;

pub use config::{BrokerConfig, ClientConfig, LlmConfig, MistConfig, ENV_DATA_DIR, ENV_SOCKET};
pub use error::ConfigError;
pub use paths::Paths;
