//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Build proxies → Attach listeners → Bind (with retry) → Start readiness tasks
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain sessions → Unbind listeners
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then bind, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: remaining sessions are dropped after the deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{StartupError, RetryPolicy};
