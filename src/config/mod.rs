//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → loader.rs build_proxies
//!         → directive.rs (tcp-request lines, time.rs for delays)
//!         → listeners declared in the protocol registry
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; already bound listeners are never
//!   reconfigured
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Directive warnings are kept, rejections stop loading

pub mod directive;
pub mod loader;
pub mod schema;
pub mod time;
pub mod validation;

pub use loader::{build_proxies, load_config, ConfigError, LoadedProxies};
pub use schema::{BindConfig, GlobalConfig, ObservabilityConfig, ProxyConfig, ProxySection};
