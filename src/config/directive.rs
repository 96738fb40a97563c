//! `tcp-request` directive handler.
//!
//! # Responsibilities
//! - `tcp-request inspect-delay <time>`
//! - `tcp-request content {accept|reject} [{if|unless} <cond>]`
//!
//! # Design Decisions
//! - Returns a three-way status with the message in a caller-owned buffer;
//!   the loader decides whether to log a warning or stop
//! - An inspect-delay set twice keeps the first value

use std::fmt;

use crate::config::time::{parse_time, TimeUnit};
use crate::diagnostic::ErrBuf;
use crate::proxy::Proxy;
use crate::rules::{Condition, Polarity, TcpAction, TcpRule};

/// Outcome of one directive line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveStatus {
    Accepted,
    /// Accepted, message explains what was ignored.
    Warning,
    Rejected,
}

impl DirectiveStatus {
    /// `0`, positive or negative.
    pub fn code(self) -> i32 {
        match self {
            DirectiveStatus::Accepted => 0,
            DirectiveStatus::Warning => 1,
            DirectiveStatus::Rejected => -1,
        }
    }
}

impl fmt::Display for DirectiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveStatus::Accepted => f.write_str("accepted"),
            DirectiveStatus::Warning => f.write_str("warning"),
            DirectiveStatus::Rejected => f.write_str("rejected"),
        }
    }
}

/// Handle one `tcp-request` line split into words, `args[0]` being the
/// keyword itself.
pub fn parse_tcp_request(args: &[&str], proxy: &mut Proxy, err: &mut ErrBuf<'_>) -> DirectiveStatus {
    let keyword = args.first().copied().unwrap_or("tcp-request");
    let kind = proxy.mode.type_str();

    let Some(sub) = args.get(1).copied().filter(|s| !s.is_empty()) else {
        err.set_fmt(format_args!(
            "missing argument for '{}' in {} '{}'",
            keyword, kind, proxy.name
        ));
        return DirectiveStatus::Rejected;
    };

    match sub {
        "inspect-delay" => inspect_delay(keyword, sub, &args[2..], proxy, err),
        "content" => content(keyword, sub, &args[2..], proxy, err),
        _ => {
            err.set_fmt(format_args!(
                "unknown argument '{}' after '{}' in {} '{}'",
                sub, keyword, kind, proxy.name
            ));
            DirectiveStatus::Rejected
        }
    }
}

fn inspect_delay(
    keyword: &str,
    sub: &str,
    rest: &[&str],
    proxy: &mut Proxy,
    err: &mut ErrBuf<'_>,
) -> DirectiveStatus {
    if proxy.is_defaults() {
        err.set_fmt(format_args!("{} {} is not allowed in 'defaults' sections", keyword, sub));
        return DirectiveStatus::Rejected;
    }

    let kind = proxy.mode.type_str();
    if !proxy.mode.has_frontend_cap() {
        err.set_fmt(format_args!(
            "{} {} will be ignored because {} '{}' has no frontend capability",
            keyword, sub, kind, proxy.name
        ));
        return DirectiveStatus::Warning;
    }

    let value = rest.first().copied().unwrap_or("");
    let delay = match parse_time(value, TimeUnit::Millis) {
        Ok(d) if !d.is_zero() => d,
        parsed => {
            err.set_fmt(format_args!(
                "'{} {}' expects a positive delay in milliseconds, in {} '{}'",
                keyword, sub, kind, proxy.name
            ));
            if let Some(c) = parsed.err().and_then(|e| e.unexpected()) {
                err.append_fmt(format_args!(" (unexpected character '{}')", c));
            }
            return DirectiveStatus::Rejected;
        }
    };

    if proxy.tcp_req.inspect_delay.is_some() {
        err.set_fmt(format_args!(
            "ignoring {} {} (was already defined) in {} '{}'",
            keyword, sub, kind, proxy.name
        ));
        return DirectiveStatus::Warning;
    }

    proxy.tcp_req.inspect_delay = Some(delay);
    DirectiveStatus::Accepted
}

fn content(
    keyword: &str,
    sub: &str,
    rest: &[&str],
    proxy: &mut Proxy,
    err: &mut ErrBuf<'_>,
) -> DirectiveStatus {
    if proxy.is_defaults() {
        err.set_fmt(format_args!("{} {} is not allowed in 'defaults' sections", keyword, sub));
        return DirectiveStatus::Rejected;
    }

    let kind = proxy.mode.type_str();
    let word = rest.first().copied().unwrap_or("");
    let Some(action) = TcpAction::parse(word) else {
        err.set_fmt(format_args!(
            "'{} {}' expects 'accept' or 'reject', in {} '{}' (was '{}')",
            keyword, sub, kind, proxy.name, word
        ));
        return DirectiveStatus::Rejected;
    };

    let cond = match rest.get(1).copied() {
        None => None,
        Some(pol_word) => {
            let Some(polarity) = Polarity::parse(pol_word) else {
                err.set_fmt(format_args!(
                    "unknown argument '{}' after '{}' in {} '{}'",
                    pol_word, word, kind, proxy.name
                ));
                return DirectiveStatus::Rejected;
            };
            match Condition::parse(polarity, &rest[2..], &proxy.acls) {
                Ok(cond) => Some(cond),
                Err(e) => {
                    err.set_fmt(format_args!(
                        "Error detected in {} '{}' while parsing '{}' condition: {}",
                        kind, proxy.name, pol_word, e
                    ));
                    return DirectiveStatus::Rejected;
                }
            }
        }
    };

    proxy.tcp_req.rules.push(TcpRule { action, cond });
    DirectiveStatus::Accepted
}
