//! Remote session allocator
//!
//! Hands out unique remote workspace paths to concurrent host runs and takes
//! them back afterwards, so paths are reused instead of growing without bound.

use crate::error::{Error, Result};
use crate::store::lock;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Default root of remote session directories
pub const DEFAULT_REMOTE_BASE: &str = "/var/lib/converge";

/// A leased remote session directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub index: usize,
    pub path: String,
}

/// Allocator of remote session indexes
///
/// `allocate` prefers a released index over raising the high-water mark.
/// Released indexes are handed out lowest first so runs stay reproducible.
#[derive(Debug, Clone)]
pub struct RemoteSessionAllocator {
    base_path: String,
    next_index: usize,
    free_indexes: BTreeSet<usize>,
}

impl RemoteSessionAllocator {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            next_index: 0,
            free_indexes: BTreeSet::new(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Highest index handed out so far
    pub fn high_water_mark(&self) -> usize {
        self.next_index
    }

    /// Lease a session: a freed index if there is one, otherwise a new one
    pub fn allocate(&mut self) -> RemoteSession {
        let index = match self.free_indexes.pop_first() {
            Some(index) => index,
            None => {
                self.next_index += 1;
                self.next_index
            }
        };
        RemoteSession {
            index,
            path: format!("{}{}", self.base_path, index),
        }
    }

    /// Return an index to the free set
    ///
    /// # Errors
    ///
    /// Returns `Error::Range` unless `0 < index <= high_water_mark()`.
    /// Releasing an index that is already free is a no-op.
    pub fn release(&mut self, index: usize) -> Result<()> {
        if index == 0 || index > self.next_index {
            return Err(Error::Range {
                index,
                max: self.next_index,
            });
        }
        self.free_indexes.insert(index);
        Ok(())
    }
}

impl Default for RemoteSessionAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE_BASE)
    }
}

/// The allocator as shared between host runs
pub type SharedAllocator = Arc<Mutex<RemoteSessionAllocator>>;

/// Wrap an allocator for sharing
pub fn shared(allocator: RemoteSessionAllocator) -> SharedAllocator {
    Arc::new(Mutex::new(allocator))
}

/// A session that goes back to the allocator when dropped
#[derive(Debug)]
pub struct SessionLease {
    allocator: SharedAllocator,
    session: RemoteSession,
}

impl SessionLease {
    pub fn acquire(allocator: &SharedAllocator) -> Self {
        let session = lock(allocator).allocate();
        log::debug!("Leased remote session {} ({})", session.index, session.path);
        Self {
            allocator: Arc::clone(allocator),
            session,
        }
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Err(e) = lock(&self.allocator).release(self.session.index) {
            log::warn!("Failed to release remote session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_counts_up() {
        let mut alloc = RemoteSessionAllocator::new("/var/lib/converge");
        let indexes: Vec<usize> = (0..3).map(|_| alloc.allocate().index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test]
    fn test_path_is_base_plus_index() {
        let mut alloc = RemoteSessionAllocator::new("/tmp/session-");
        assert_eq!(alloc.allocate().path, "/tmp/session-1");
    }

    #[test]
    fn test_released_index_is_reused_first() {
        let mut alloc = RemoteSessionAllocator::default();
        for _ in 0..3 {
            alloc.allocate();
        }
        alloc.release(2).unwrap();
        assert_eq!(alloc.allocate().index, 2);
        assert_eq!(alloc.allocate().index, 4);
    }

    #[test]
    fn test_release_out_of_range() {
        let mut alloc = RemoteSessionAllocator::default();
        alloc.allocate();
        alloc.allocate();
        assert!(matches!(alloc.release(0), Err(Error::Range { index: 0, max: 2 })));
        assert!(matches!(alloc.release(3), Err(Error::Range { index: 3, max: 2 })));
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut alloc = RemoteSessionAllocator::default();
        alloc.allocate();
        alloc.release(1).unwrap();
        alloc.release(1).unwrap();
        assert_eq!(alloc.allocate().index, 1);
        assert_eq!(alloc.allocate().index, 2);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let allocator = shared(RemoteSessionAllocator::default());
        {
            let lease = SessionLease::acquire(&allocator);
            assert_eq!(lease.session().index, 1);
            let second = SessionLease::acquire(&allocator);
            assert_eq!(second.session().index, 2);
        }
        let lease = SessionLease::acquire(&allocator);
        assert_eq!(lease.session().index, 1);
    }

    #[test]
    fn test_concurrent_leases_are_unique() {
        let allocator = shared(RemoteSessionAllocator::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || lock(&allocator).allocate().index)
            })
            .collect();
        let mut indexes: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, (1..=8).collect::<Vec<_>>());
    }
}
