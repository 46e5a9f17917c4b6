//! Memory accounting
//!
//! Every heap slot allocation and release funnels through a single
//! [`MemoryAccount`] shared between the VM and its embedder, mirroring a
//! `realloc`-style allocation hook: `realloc(old, new)` adjusts the running
//! used-bytes counter by `new - old` and enforces an optional limit. A
//! refused allocation is the VM's out-of-memory condition and is fatal to
//! the instance.

use std::cell::Cell;
use std::rc::Rc;

/// Running used-bytes counter with an optional hard limit.
///
/// Single-threaded by contract (like the VM that charges against it);
/// shared via `Rc`.
#[derive(Debug)]
pub struct MemoryAccount {
    used: Cell<usize>,
    limit: Cell<Option<usize>>,
}

impl MemoryAccount {
    /// Create an unlimited account.
    pub fn unlimited() -> Rc<Self> {
        Rc::new(Self {
            used: Cell::new(0),
            limit: Cell::new(None),
        })
    }

    /// Create an account with a hard byte limit.
    pub fn with_limit(limit: usize) -> Rc<Self> {
        Rc::new(Self {
            used: Cell::new(0),
            limit: Cell::new(Some(limit)),
        })
    }

    /// Adjust the counter by `new - old` bytes.
    ///
    /// Returns `false` (and leaves the counter unchanged) when growing past
    /// the limit; a free (`new == 0`) always succeeds.
    pub fn realloc(&self, old: usize, new: usize) -> bool {
        let used = self.used.get();
        let next = used.saturating_sub(old).saturating_add(new);
        if new > old {
            if let Some(limit) = self.limit.get() {
                if next > limit {
                    return false;
                }
            }
        }
        self.used.set(next);
        true
    }

    /// Bytes currently accounted.
    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Configured limit, if any.
    pub fn limit(&self) -> Option<usize> {
        self.limit.get()
    }

    /// Change the limit. Lowering it below current usage does not fail
    /// retroactively; the next growing allocation will.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit.set(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_account() {
        let acct = MemoryAccount::unlimited();
        assert!(acct.realloc(0, 1024));
        assert_eq!(acct.used(), 1024);
        assert!(acct.realloc(1024, 0));
        assert_eq!(acct.used(), 0);
    }

    #[test]
    fn test_limit_refuses_growth() {
        let acct = MemoryAccount::with_limit(100);
        assert!(acct.realloc(0, 80));
        assert!(!acct.realloc(0, 40));
        // Refusal leaves the counter unchanged.
        assert_eq!(acct.used(), 80);
        // Shrinking still works.
        assert!(acct.realloc(80, 10));
        assert_eq!(acct.used(), 10);
    }

    #[test]
    fn test_free_always_succeeds() {
        let acct = MemoryAccount::with_limit(16);
        assert!(acct.realloc(0, 16));
        assert!(acct.realloc(16, 0));
        assert_eq!(acct.used(), 0);
    }
}
