//! UID, UIDVALIDITY and UID range types

use crate::{CoreError, CoreResult};
use std::fmt;
use std::num::NonZeroU64;

/// A per-mailbox message UID.
///
/// UIDs are never zero; converting `0` into a `Uid` is a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(NonZeroU64);

impl Uid {
    /// Smallest valid UID
    pub const MIN: Self = Uid(NonZeroU64::MIN);
    /// Largest valid UID
    pub const MAX: Self = Uid(NonZeroU64::MAX);

    /// Create a UID, returning `None` for zero
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Uid)
    }

    /// Raw value
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// The UID following this one, if any
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Uid)
    }
}

impl TryFrom<u64> for Uid {
    type Error = CoreError;

    fn try_from(value: u64) -> CoreResult<Self> {
        Uid::new(value).ok_or_else(|| CoreError::contract("UID must be non-zero"))
    }
}

impl From<Uid> for u64 {
    fn from(uid: Uid) -> Self {
        uid.get()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UIDVALIDITY of a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UidValidity(NonZeroU64);

impl UidValidity {
    /// Create a UIDVALIDITY, returning `None` for zero
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(UidValidity)
    }

    /// Raw value
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Generate a fresh value from the current UNIX time in seconds.
    ///
    /// When `previous` is given the result is strictly greater than it, so a
    /// mailbox recreated within the same second still gets a new epoch.
    pub fn generate(previous: Option<UidValidity>) -> Self {
        let now = chrono::Utc::now().timestamp().max(1) as u64;
        let value = match previous {
            Some(prev) if prev.get() >= now => prev.get().saturating_add(1),
            _ => now,
        };
        UidValidity(NonZeroU64::new(value).unwrap_or(NonZeroU64::MIN))
    }
}

impl TryFrom<u64> for UidValidity {
    type Error = CoreError;

    fn try_from(value: u64) -> CoreResult<Self> {
        UidValidity::new(value).ok_or_else(|| CoreError::contract("UIDVALIDITY must be non-zero"))
    }
}

impl fmt::Display for UidValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive range of UIDs, `start..=end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UidRange {
    start: Uid,
    end: Uid,
}

impl UidRange {
    /// Create a range; `start` must not exceed `end`
    pub fn new(start: Uid, end: Uid) -> CoreResult<Self> {
        if start > end {
            return Err(CoreError::contract(format!(
                "inverted UID range {}:{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Create a range from raw values
    pub fn from_raw(start: u64, end: u64) -> CoreResult<Self> {
        Self::new(Uid::try_from(start)?, Uid::try_from(end)?)
    }

    /// Range covering exactly one UID
    pub fn single(uid: Uid) -> Self {
        Self { start: uid, end: uid }
    }

    /// Open-ended range `start:*`
    pub fn starting_at(start: Uid) -> Self {
        Self {
            start,
            end: Uid::MAX,
        }
    }

    /// Range covering every valid UID
    pub fn all() -> Self {
        Self::starting_at(Uid::MIN)
    }

    pub fn start(&self) -> Uid {
        self.start
    }

    pub fn end(&self) -> Uid {
        self.end
    }

    /// Check whether `uid` lies within the range
    pub fn contains(&self, uid: Uid) -> bool {
        self.start <= uid && uid <= self.end
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else if self.end == Uid::MAX {
            write!(f, "{}:*", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}
