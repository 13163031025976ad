//! UID allocation for a single mailbox

use crate::{CoreError, CoreResult, Uid, UidValidity};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Backing store for a mailbox's UID counter.
///
/// `increment` must be a single atomic read-modify-write: either the counter
/// moves forward by one and the new value is returned, or nothing changes and
/// an error is returned. Implementations must not retry internally on
/// [`CoreError::PersistenceConflict`].
#[async_trait]
pub trait UidCounter: Send + Sync {
    /// Advance the counter by one and return the new value
    async fn increment(&self) -> CoreResult<u64>;

    /// Highest value issued so far
    async fn last_uid(&self) -> CoreResult<u64>;

    /// UIDVALIDITY of the numbering epoch this counter belongs to
    fn uid_validity(&self) -> UidValidity;
}

/// Lock-free in-memory counter
#[derive(Debug)]
pub struct MemoryUidCounter {
    last_uid: AtomicU64,
    uid_validity: UidValidity,
}

impl MemoryUidCounter {
    pub fn new(uid_validity: UidValidity, last_uid: u64) -> Self {
        Self {
            last_uid: AtomicU64::new(last_uid),
            uid_validity,
        }
    }
}

#[async_trait]
impl UidCounter for MemoryUidCounter {
    async fn increment(&self) -> CoreResult<u64> {
        let mut current = self.last_uid.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(1).ok_or(CoreError::UidExhausted)?;
            match self.last_uid.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    async fn last_uid(&self) -> CoreResult<u64> {
        Ok(self.last_uid.load(Ordering::Acquire))
    }

    fn uid_validity(&self) -> UidValidity {
        self.uid_validity
    }
}

/// Issues strictly increasing UIDs for one mailbox.
///
/// Cheap to clone; clones share the same counter.
#[derive(Clone)]
pub struct UidAllocator {
    counter: Arc<dyn UidCounter>,
    uid_validity: UidValidity,
}

impl UidAllocator {
    /// Create an allocator over an existing counter
    pub fn new(counter: Arc<dyn UidCounter>) -> Self {
        let uid_validity = counter.uid_validity();
        Self {
            counter,
            uid_validity,
        }
    }

    /// Create an allocator backed by a fresh in-memory counter
    pub fn in_memory(uid_validity: UidValidity, last_uid: u64) -> Self {
        Self::new(Arc::new(MemoryUidCounter::new(uid_validity, last_uid)))
    }

    /// Consume the next UID.
    ///
    /// Fails with [`CoreError::PersistenceConflict`] when another writer
    /// advanced the backing counter first; the caller decides whether to
    /// retry.
    pub async fn consume_next_uid(&self) -> CoreResult<Uid> {
        let value = self.counter.increment().await?;
        let uid = Uid::new(value).ok_or_else(|| {
            CoreError::Storage("UID counter returned zero".to_string())
        })?;
        trace!("Allocated UID {} (validity {})", uid, self.uid_validity);
        Ok(uid)
    }

    /// UIDVALIDITY, fixed for the lifetime of this allocator
    pub fn uid_validity(&self) -> UidValidity {
        self.uid_validity
    }

    /// Highest UID issued so far (0 if none)
    pub async fn last_uid(&self) -> CoreResult<u64> {
        self.counter.last_uid().await
    }
}

impl std::fmt::Debug for UidAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UidAllocator")
            .field("uid_validity", &self.uid_validity)
            .finish_non_exhaustive()
    }
}
