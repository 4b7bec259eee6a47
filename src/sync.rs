use std::sync::Arc;

use parking_lot::RwLock;

/// A shared cell holding an optional `Arc` node, supporting pointer-identity
/// compare-and-set. Version-chain heads and `prev` links are stored in these
/// cells: a committer inserts a new head only if the head it observed is
/// still current, and retries when concurrent reclamation nulled it out.
///
/// The compare-and-set runs inside a short critical section rather than a
/// raw atomic CAS; refcounted nodes cannot be swapped lock-free without an
/// epoch collector, and the cell preserves the same ABA-tolerant contract.
#[derive(Debug)]
pub struct VersionCell<T> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> VersionCell<T> {
    pub fn new(value: Option<Arc<T>>) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Clones the current value out of the cell.
    pub fn load(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    /// True when the cell currently holds `expected` (by pointer identity).
    pub fn is(&self, expected: Option<&Arc<T>>) -> bool {
        ptr_eq(self.inner.read().as_ref(), expected)
    }

    /// Unconditional store.
    pub fn store(&self, value: Option<Arc<T>>) {
        *self.inner.write() = value;
    }

    /// Stores `new` only if the cell still holds `expected` by pointer
    /// identity. On failure returns the value actually observed.
    pub fn compare_and_set(
        &self,
        expected: Option<&Arc<T>>,
        new: Option<Arc<T>>,
    ) -> Result<(), Option<Arc<T>>> {
        let mut guard = self.inner.write();
        if ptr_eq(guard.as_ref(), expected) {
            *guard = new;
            Ok(())
        } else {
            Err(guard.clone())
        }
    }

    /// Takes the value out, leaving `None`.
    pub fn take(&self) -> Option<Arc<T>> {
        self.inner.write().take()
    }
}

impl<T> Default for VersionCell<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

fn ptr_eq<T>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
