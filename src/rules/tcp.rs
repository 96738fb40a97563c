//! Ordered `tcp-request content` rules.
//!
//! # Data Flow
//! ```text
//! facts ──► rule 1 ──► rule 2 ──► ... ──► (no match) Accept
//!             │ cond Pass  -> action
//!             │ cond Miss  -> Wait (window open) / skip (window closed)
//!             │ cond Fail  -> next rule
//! ```

use std::fmt;

use crate::rules::acl::{AclResult, Condition, ConditionEvaluator, FactSource};

/// What a matching rule does with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpAction {
    Accept,
    Reject,
}

impl TcpAction {
    pub fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "accept" => Some(TcpAction::Accept),
            "reject" => Some(TcpAction::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for TcpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpAction::Accept => f.write_str("accept"),
            TcpAction::Reject => f.write_str("reject"),
        }
    }
}

/// Outcome of running the rule list once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
    /// A condition could still change; ask again with more data.
    Wait,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::Reject => "reject",
            Verdict::Wait => "wait",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpRule {
    pub action: TcpAction,
    /// Unconditional when absent.
    pub cond: Option<Condition>,
}

impl fmt::Display for TcpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cond {
            Some(cond) => write!(f, "{} {}", self.action, cond),
            None => write!(f, "{}", self.action),
        }
    }
}

/// Rules kept in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TcpRuleSet {
    rules: Vec<TcpRule>,
}

impl TcpRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail.
    pub fn push(&mut self, rule: TcpRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TcpRule> {
        self.rules.iter()
    }

    /// First matching rule decides. `partial` is true while the inspection
    /// window is still open.
    pub fn evaluate<E>(&self, evaluator: &E, facts: &dyn FactSource, partial: bool) -> Verdict
    where
        E: ConditionEvaluator + ?Sized,
    {
        for rule in &self.rules {
            let matched = match &rule.cond {
                None => true,
                Some(cond) => match evaluator.evaluate(cond, facts, partial) {
                    AclResult::Pass => true,
                    AclResult::Fail => false,
                    AclResult::Miss if partial => return Verdict::Wait,
                    AclResult::Miss => false,
                },
            };
            if matched {
                return match rule.action {
                    TcpAction::Accept => Verdict::Accept,
                    TcpAction::Reject => Verdict::Reject,
                };
            }
        }
        Verdict::Accept
    }
}
