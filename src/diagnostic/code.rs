//! Composite severity/retry codes.
//!
//! # Responsibilities
//! - Encode the outcome of a setup step as a small bit-set
//! - Split the control-flow bits (retryable, fatal, abort) from the display
//!   bits (warn, alert)
//!
//! # Design Decisions
//! - `ABORT` carries the `FATAL` bit, so an abort can never be built without it
//! - Combination is a plain bitwise OR (commutative, associative, idempotent)

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

const RETRYABLE_BIT: u8 = 0x01;
const FATAL_BIT: u8 = 0x02;
const ABORT_BIT: u8 = 0x04;
const WARN_BIT: u8 = 0x08;
const ALERT_BIT: u8 = 0x10;

const CODE_MASK: u8 = RETRYABLE_BIT | FATAL_BIT | ABORT_BIT;
const LEVEL_MASK: u8 = WARN_BIT | ALERT_BIT;

/// Result of a setup operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrCode(u8);

impl ErrCode {
    /// Everything went fine, no message.
    pub const NONE: Self = Self(0);
    /// The error may vanish on retry (eg: port in use).
    pub const RETRYABLE: Self = Self(RETRYABLE_BIT);
    /// Non-recoverable without a configuration or resource change.
    pub const FATAL: Self = Self(FATAL_BIT);
    /// Pointless to try further listeners in this batch. Implies `FATAL`.
    pub const ABORT: Self = Self(ABORT_BIT | FATAL_BIT);
    /// A message is present and should be shown as a warning.
    pub const WARN: Self = Self(WARN_BIT);
    /// A message is present and should be shown as an alert.
    pub const ALERT: Self = Self(ALERT_BIT);

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild a code from raw bits. An abort bit without fatal is completed.
    pub const fn from_bits(bits: u8) -> Self {
        let mut bits = bits & (CODE_MASK | LEVEL_MASK);
        if bits & ABORT_BIT != 0 {
            bits |= FATAL_BIT;
        }
        Self(bits)
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no bit at all is set.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The control-flow subset, ignoring warn/alert.
    pub const fn code(self) -> Self {
        Self(self.0 & CODE_MASK)
    }

    /// The display subset (warn/alert).
    pub const fn level(self) -> Self {
        Self(self.0 & LEVEL_MASK)
    }

    pub const fn is_retryable(self) -> bool {
        self.0 & RETRYABLE_BIT != 0
    }

    pub const fn is_fatal(self) -> bool {
        self.0 & FATAL_BIT != 0
    }

    pub const fn is_abort(self) -> bool {
        self.0 & ABORT_BIT != 0
    }

    /// True if the outcome is a failure rather than just a message.
    pub const fn is_failure(self) -> bool {
        self.0 & CODE_MASK != 0
    }
}

impl BitOr for ErrCode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrCode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("NONE");
        }
        let names = [
            (RETRYABLE_BIT, "RETRYABLE"),
            (FATAL_BIT, "FATAL"),
            (ABORT_BIT, "ABORT"),
            (WARN_BIT, "WARN"),
            (ALERT_BIT, "ALERT"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrCode({})", self)
    }
}
