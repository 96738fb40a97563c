//! Boolean conditions over connection facts.
//!
//! # Responsibilities
//! - Declare named ACLs: `acl <name> <fetch> [<op>] <value>...`
//! - Parse `if`/`unless` conditions referencing them
//! - Evaluate conditions to a tri-state result
//! - Provide the `req_len` fact (bytes of request seen so far)
//!
//! # Design Decisions
//! - While the window is partial, a failed test on a fact that may still
//!   change yields `Miss`, not `Fail`, so the caller can wait for more data.
//!   Once the window closes the same test is a plain `Fail`
//! - Samples are never cached: `req_len` is volatile within a window
//! - Conditions are OR-ed groups of AND-ed terms; `unless` negates the result
//!   but leaves `Miss` as is

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Outcome of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclResult {
    Fail,
    /// Not satisfied yet, but could be once more data arrives.
    Miss,
    Pass,
}

impl AclResult {
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (AclResult::Fail, _) | (_, AclResult::Fail) => AclResult::Fail,
            (AclResult::Miss, _) | (_, AclResult::Miss) => AclResult::Miss,
            _ => AclResult::Pass,
        }
    }

    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (AclResult::Pass, _) | (_, AclResult::Pass) => AclResult::Pass,
            (AclResult::Miss, _) | (_, AclResult::Miss) => AclResult::Miss,
            _ => AclResult::Fail,
        }
    }

    pub fn negate(self) -> Self {
        match self {
            AclResult::Pass => AclResult::Fail,
            AclResult::Fail => AclResult::Pass,
            AclResult::Miss => AclResult::Miss,
        }
    }
}

/// Facts an ACL can fetch about a connection.
pub trait FactSource {
    /// Bytes of request observed so far, `None` without a request buffer.
    fn request_len(&self) -> Option<usize>;
}

/// Snapshot of facts for one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFacts {
    pub request_len: Option<usize>,
}

impl FactSource for ConnectionFacts {
    fn request_len(&self) -> Option<usize> {
        self.request_len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFlags {
    /// Must not be cached between evaluations.
    pub volatile: bool,
    /// More data may still change the value.
    pub may_change: bool,
}

/// A fetched value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub value: u64,
    pub flags: SampleFlags,
}

/// `req_len`: bytes of request observed so far.
pub fn fetch_req_len(facts: &dyn FactSource) -> Option<Sample> {
    facts.request_len().map(|len| Sample {
        value: len as u64,
        flags: SampleFlags {
            volatile: true,
            may_change: true,
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    ReqLen,
    Always(bool),
}

impl Fetch {
    fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "req_len" => Some(Fetch::ReqLen),
            "always_true" => Some(Fetch::Always(true)),
            "always_false" => Some(Fetch::Always(false)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl IntOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(IntOp::Eq),
            "ge" => Some(IntOp::Ge),
            "gt" => Some(IntOp::Gt),
            "le" => Some(IntOp::Le),
            "lt" => Some(IntOp::Lt),
            _ => None,
        }
    }

    fn matches(self, sample: u64, value: u64) -> bool {
        match self {
            IntOp::Eq => sample == value,
            IntOp::Ge => sample >= value,
            IntOp::Gt => sample > value,
            IntOp::Le => sample <= value,
            IntOp::Lt => sample < value,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    #[error("missing ACL name")]
    MissingName,
    #[error("unknown fetch method '{0}' in ACL")]
    UnknownFetch(String),
    #[error("ACL '{0}' expects at least one value")]
    MissingPattern(String),
    #[error("invalid integer value '{0}' in ACL")]
    BadPattern(String),
    #[error("missing condition after '{0}'")]
    MissingCondition(String),
    #[error("no such ACL: '{0}'")]
    UnknownAcl(String),
    #[error("empty term around 'or'")]
    EmptyGroup,
}

/// A named test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    name: String,
    fetch: Fetch,
    patterns: Vec<(IntOp, u64)>,
}

impl Acl {
    /// Parse `<name> <fetch> [<op>] <value>...`.
    pub fn parse(args: &[&str]) -> Result<Self, AclError> {
        let (name, rest) = args.split_first().ok_or(AclError::MissingName)?;
        let (keyword, mut values) = rest
            .split_first()
            .ok_or_else(|| AclError::UnknownFetch(String::new()))?;
        let fetch = Fetch::parse(keyword).ok_or_else(|| AclError::UnknownFetch(keyword.to_string()))?;

        let mut patterns = Vec::new();
        if fetch == Fetch::ReqLen {
            let mut op = IntOp::Eq;
            if let Some(parsed) = values.first().and_then(|v| IntOp::parse(v)) {
                op = parsed;
                values = &values[1..];
            }
            for value in values {
                let v = value
                    .parse::<u64>()
                    .map_err(|_| AclError::BadPattern(value.to_string()))?;
                patterns.push((op, v));
            }
            if patterns.is_empty() {
                return Err(AclError::MissingPattern(name.to_string()));
            }
        }

        Ok(Self {
            name: name.to_string(),
            fetch,
            patterns,
        })
    }

    fn always(name: &str, value: bool) -> Self {
        Self {
            name: name.to_string(),
            fetch: Fetch::Always(value),
            patterns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fetch(&self) -> Fetch {
        self.fetch
    }

    /// Test the ACL. `partial` is true while more data may still arrive.
    pub fn eval(&self, facts: &dyn FactSource, partial: bool) -> AclResult {
        let sample = match self.fetch {
            Fetch::Always(true) => return AclResult::Pass,
            Fetch::Always(false) => return AclResult::Fail,
            Fetch::ReqLen => fetch_req_len(facts),
        };
        let Some(sample) = sample else {
            return AclResult::Fail;
        };
        if self
            .patterns
            .iter()
            .any(|(op, v)| op.matches(sample.value, *v))
        {
            AclResult::Pass
        } else if partial && sample.flags.may_change {
            AclResult::Miss
        } else {
            AclResult::Fail
        }
    }
}

/// ACLs declared in one proxy, plus the predefined `TRUE` and `FALSE`.
#[derive(Debug, Clone, Default)]
pub struct AclSet {
    acls: Vec<Arc<Acl>>,
}

impl AclSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, acl: Acl) {
        self.acls.push(Arc::new(acl));
    }

    pub fn len(&self) -> usize {
        self.acls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acls.is_empty()
    }

    /// Look up by name. Later declarations with the same name win.
    pub fn find(&self, name: &str) -> Option<Arc<Acl>> {
        if let Some(acl) = self.acls.iter().rev().find(|a| a.name == name) {
            return Some(Arc::clone(acl));
        }
        match name {
            "TRUE" => Some(Arc::new(Acl::always("TRUE", true))),
            "FALSE" => Some(Arc::new(Acl::always("FALSE", false))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    If,
    Unless,
}

impl Polarity {
    pub fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "if" => Some(Polarity::If),
            "unless" => Some(Polarity::Unless),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CondTerm {
    negate: bool,
    acl: Arc<Acl>,
}

/// A parsed `if`/`unless` condition.
#[derive(Debug, Clone)]
pub struct Condition {
    polarity: Polarity,
    groups: Vec<Vec<CondTerm>>,
}

impl Condition {
    /// Parse the words after `if`/`unless`.
    pub fn parse(polarity: Polarity, args: &[&str], acls: &AclSet) -> Result<Self, AclError> {
        let keyword = match polarity {
            Polarity::If => "if",
            Polarity::Unless => "unless",
        };
        if args.is_empty() {
            return Err(AclError::MissingCondition(keyword.to_string()));
        }

        let mut groups = Vec::new();
        let mut current = Vec::new();
        for word in args {
            if *word == "or" || *word == "||" {
                if current.is_empty() {
                    return Err(AclError::EmptyGroup);
                }
                groups.push(std::mem::take(&mut current));
                continue;
            }
            let (negate, name) = match word.strip_prefix('!') {
                Some(name) => (true, name),
                None => (false, *word),
            };
            let acl = acls
                .find(name)
                .ok_or_else(|| AclError::UnknownAcl(name.to_string()))?;
            current.push(CondTerm { negate, acl });
        }
        if current.is_empty() {
            return Err(AclError::EmptyGroup);
        }
        groups.push(current);

        Ok(Self { polarity, groups })
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.polarity {
            Polarity::If => f.write_str("if")?,
            Polarity::Unless => f.write_str("unless")?,
        }
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                f.write_str(" or")?;
            }
            for term in group {
                let bang = if term.negate { "!" } else { "" };
                write!(f, " {}{}", bang, term.acl.name)?;
            }
        }
        Ok(())
    }
}

/// Evaluates conditions against connection facts.
pub trait ConditionEvaluator {
    fn evaluate(&self, cond: &Condition, facts: &dyn FactSource, partial: bool) -> AclResult;
}

/// Evaluator for [`Condition`]s built from an [`AclSet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AclEvaluator;

impl ConditionEvaluator for AclEvaluator {
    fn evaluate(&self, cond: &Condition, facts: &dyn FactSource, partial: bool) -> AclResult {
        let mut result = AclResult::Fail;
        for group in &cond.groups {
            let mut group_result = AclResult::Pass;
            for term in group {
                let mut r = term.acl.eval(facts, partial);
                if term.negate {
                    r = r.negate();
                }
                group_result = group_result.and(r);
                if group_result == AclResult::Fail {
                    break;
                }
            }
            result = result.or(group_result);
            if result == AclResult::Pass {
                break;
            }
        }
        match cond.polarity {
            Polarity::If => result,
            Polarity::Unless => result.negate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(len: usize) -> ConnectionFacts {
        ConnectionFacts {
            request_len: Some(len),
        }
    }

    fn acls() -> AclSet {
        let mut set = AclSet::new();
        set.add(Acl::parse(&["short", "req_len", "lt", "10"]).unwrap());
        set.add(Acl::parse(&["has_data", "req_len", "gt", "0"]).unwrap());
        set.add(Acl::parse(&["exact", "req_len", "4", "8"]).unwrap());
        set
    }

    #[test]
    fn req_len_is_volatile_and_may_change() {
        let sample = fetch_req_len(&facts(12)).unwrap();
        assert_eq!(sample.value, 12);
        assert!(sample.flags.volatile && sample.flags.may_change);
        assert!(fetch_req_len(&ConnectionFacts::default()).is_none());
    }

    #[test]
    fn failing_test_on_changing_fact_is_a_miss_while_partial() {
        let set = acls();
        let has_data = set.find("has_data").unwrap();
        assert_eq!(has_data.eval(&facts(0), true), AclResult::Miss);
        assert_eq!(has_data.eval(&facts(3), true), AclResult::Pass);
        assert_eq!(has_data.eval(&ConnectionFacts::default(), true), AclResult::Fail);

        let exact = set.find("exact").unwrap();
        assert_eq!(exact.eval(&facts(8), true), AclResult::Pass);
        assert_eq!(exact.eval(&facts(5), true), AclResult::Miss);
    }

    #[test]
    fn failing_test_is_a_fail_once_window_closes() {
        let set = acls();
        let has_data = set.find("has_data").unwrap();
        assert_eq!(has_data.eval(&facts(0), false), AclResult::Fail);
        assert_eq!(has_data.eval(&facts(3), false), AclResult::Pass);

        let short = set.find("short").unwrap();
        assert_eq!(short.eval(&facts(20), false), AclResult::Fail);
        assert_eq!(short.eval(&facts(20), true), AclResult::Miss);
    }

    #[test]
    fn parse_rejects_bad_acls() {
        assert_eq!(Acl::parse(&[]), Err(AclError::MissingName));
        assert_eq!(
            Acl::parse(&["x", "src"]),
            Err(AclError::UnknownFetch("src".into()))
        );
        assert_eq!(
            Acl::parse(&["x", "req_len", "ge"]),
            Err(AclError::MissingPattern("x".into()))
        );
        assert_eq!(
            Acl::parse(&["x", "req_len", "ten"]),
            Err(AclError::BadPattern("ten".into()))
        );
    }

    #[test]
    fn conditions_combine_and_or_and_negation() {
        let set = acls();
        let eval = AclEvaluator;

        let cond = Condition::parse(Polarity::If, &["has_data", "!short"], &set).unwrap();
        assert_eq!(eval.evaluate(&cond, &facts(20), false), AclResult::Pass);
        assert_eq!(eval.evaluate(&cond, &facts(20), true), AclResult::Miss);
        assert_eq!(eval.evaluate(&cond, &facts(5), false), AclResult::Fail);
        assert_eq!(eval.evaluate(&cond, &facts(5), true), AclResult::Fail);

        let cond = Condition::parse(Polarity::If, &["FALSE", "or", "exact"], &set).unwrap();
        assert_eq!(eval.evaluate(&cond, &facts(4), true), AclResult::Pass);
        assert_eq!(eval.evaluate(&cond, &facts(5), true), AclResult::Miss);
        assert_eq!(eval.evaluate(&cond, &facts(5), false), AclResult::Fail);
        assert_eq!(cond.to_string(), "if FALSE or exact");
    }

    #[test]
    fn unless_negates_but_keeps_miss() {
        let set = acls();
        let eval = AclEvaluator;
        let cond = Condition::parse(Polarity::Unless, &["has_data"], &set).unwrap();
        assert_eq!(eval.evaluate(&cond, &facts(1), true), AclResult::Fail);
        assert_eq!(eval.evaluate(&cond, &facts(0), true), AclResult::Miss);
        assert_eq!(eval.evaluate(&cond, &facts(0), false), AclResult::Pass);

        let cond = Condition::parse(Polarity::Unless, &["short"], &set).unwrap();
        assert_eq!(eval.evaluate(&cond, &facts(20), false), AclResult::Pass);
        assert_eq!(eval.evaluate(&cond, &facts(3), false), AclResult::Fail);

        let cond = Condition::parse(Polarity::Unless, &["TRUE"], &set).unwrap();
        assert_eq!(eval.evaluate(&cond, &facts(0), true), AclResult::Fail);
    }

    #[test]
    fn condition_parse_errors() {
        let set = acls();
        assert!(matches!(
            Condition::parse(Polarity::If, &[], &set),
            Err(AclError::MissingCondition(_))
        ));
        assert!(matches!(
            Condition::parse(Polarity::If, &["nope"], &set),
            Err(AclError::UnknownAcl(_))
        ));
        assert!(matches!(
            Condition::parse(Polarity::If, &["short", "or"], &set),
            Err(AclError::EmptyGroup)
        ));
    }
}
