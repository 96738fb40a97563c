//! TCP frontend library: listener lifecycle, transparent binding and
//! content rules for a TCP reverse proxy.

pub mod config;
pub mod diagnostic;
pub mod net;
pub mod proxy;
pub mod rules;
pub mod session;
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use diagnostic::{ErrBuf, ErrCode};
pub use lifecycle::Shutdown;
pub use net::protocol::ProtocolRegistry;
