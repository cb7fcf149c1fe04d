//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SluiceConfig (validated, immutable)
//!     → stage::factory builds pipeline templates
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → templates rebuilt and swapped atomically
//!     → new connections use the new chains
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BufferConfig, InstanceConfig, ListenerConfig, LogFormat, ObservabilityConfig, PipelineConfig,
    SluiceConfig, StageConfig,
};
pub use validation::ValidationError;
