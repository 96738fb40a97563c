//! Bounded diagnostic messages.
//!
//! # Responsibilities
//! - Write messages into caller-supplied fixed-capacity storage
//! - Never write past capacity, always NUL-terminate
//! - Produce nothing when there is no storage or its capacity is zero
//!
//! # Design Decisions
//! - Truncation happens on a UTF-8 boundary so `as_str` stays valid
//! - Once truncated, later appends are dropped instead of splicing fragments

use std::fmt;

/// Caller-owned message buffer.
#[derive(Debug)]
pub struct ErrBuf<'a> {
    buf: Option<&'a mut [u8]>,
    len: usize,
    truncated: bool,
}

impl<'a> ErrBuf<'a> {
    /// Wrap `buf`. The buffer is reset so a caller never reads stale text.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let mut err = Self {
            buf: Some(buf),
            len: 0,
            truncated: false,
        };
        err.clear();
        err
    }

    /// A sink that swallows every message.
    pub fn discard() -> Self {
        Self {
            buf: None,
            len: 0,
            truncated: false,
        }
    }

    /// Total capacity including the terminating NUL.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if the last message did not fit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Drop the current message.
    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
        if let Some(buf) = self.buf.as_deref_mut() {
            if let Some(first) = buf.first_mut() {
                *first = 0;
            }
        }
    }

    /// Replace the message with `msg`.
    pub fn set(&mut self, msg: &str) {
        self.clear();
        self.push(msg);
    }

    /// Replace the message with formatted text.
    pub fn set_fmt(&mut self, args: fmt::Arguments<'_>) {
        self.clear();
        self.append_fmt(args);
    }

    /// Append formatted text to the current message.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) {
        // write_str below never fails
        let _ = fmt::Write::write_fmt(self, args);
    }

    /// The message currently held, empty if none.
    pub fn as_str(&self) -> &str {
        match self.buf.as_deref() {
            Some(buf) => std::str::from_utf8(&buf[..self.len]).unwrap_or(""),
            None => "",
        }
    }

    /// Owned copy of the message, `None` when empty.
    pub fn to_message(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.as_str().to_owned())
        }
    }

    fn push(&mut self, s: &str) {
        if self.truncated {
            return;
        }
        let len = self.len;
        let Some(buf) = self.buf.as_deref_mut() else {
            return;
        };
        if buf.is_empty() {
            return;
        }
        let room = buf.len() - 1 - len;
        let mut n = s.len().min(room);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        buf[len..len + n].copy_from_slice(&s.as_bytes()[..n]);
        buf[len + n] = 0;
        self.len = len + n;
        if n < s.len() {
            self.truncated = true;
        }
    }
}

impl fmt::Write for ErrBuf<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s);
        Ok(())
    }
}
