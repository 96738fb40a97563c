//! Content inspection rules.
//!
//! # Responsibilities
//! - Named ACLs and `if`/`unless` conditions (`acl`)
//! - Ordered accept/reject rules evaluated on connection content (`tcp`)

pub mod acl;
pub mod tcp;

pub use acl::{Acl, AclError, AclEvaluator, AclResult, AclSet, Condition, ConditionEvaluator, ConnectionFacts, FactSource, Polarity};
pub use tcp::{TcpAction, TcpRule, TcpRuleSet, Verdict};
