//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configuration
//!     → protocol.rs (registry: tcpv4/tcpv6 descriptors own listeners)
//!     → listener.rs (Init → Assigned → Listening)
//!         → socket.rs (syscall seam, process socket ceiling)
//!         → foreign.rs (transparent bind, capability cache)
//!     → fd.rs (typed fd registration)
//!     → event_loop.rs (readiness tasks, accept)
//!     → connection.rs (ids, live session tracking)
//!     → Hand off to session layer
//! ```
//!
//! # Design Decisions
//! - Every syscall goes through `ListenSocket` so bind paths are testable
//!   without privileges
//! - Binding is synchronous and happens before serving starts
//! - The listener owns its socket; dropping it closes the fd

pub mod connection;
pub mod event_loop;
pub mod fd;
pub mod foreign;
pub mod listener;
pub mod protocol;
pub mod socket;
