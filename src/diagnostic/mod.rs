//! Diagnostic reporting for setup operations.
//!
//! # Data Flow
//! ```text
//! Listener bind / directive handler
//!     → code.rs (ErrCode: severity + retry bits, combined with |)
//!     → message.rs (ErrBuf: bounded, NUL-terminated message)
//!     → caller decides: continue, retry the batch, or abort
//! ```
//!
//! # Design Decisions
//! - Codes are plain bit-sets so batches aggregate with `|=`
//! - Warn/Alert only describe how loudly to print the message
//! - Messages go into caller-owned storage; nothing is allocated on the bind path

pub mod code;
pub mod message;

pub use code::ErrCode;
pub use message::ErrBuf;
