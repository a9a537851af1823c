use std::cell::UnsafeCell;

use parking_lot::ReentrantMutex;

/// A lock a thread may re-acquire while already holding it — specifically,
/// the fault-recovery re-entry case: `clearHostCodeForWriting`
/// may be called from a fault handler that interrupted a thread already
/// inside a `.with()` call on this same lock.
///
/// `parking_lot::ReentrantMutex` only hands out `&T`, so the protected
/// state needs interior mutability; a `RefCell` looks like the obvious
/// choice but is wrong here, since a nested `.with()` call would try to
/// `borrow_mut()` while the outer call's `RefMut` is still alive on the
/// stack (paused, not dropped) and panic. This is exactly the access
/// pattern the type exists to support, so the cell is an `UnsafeCell`
/// instead: each `.with()` call hands out a fresh `&mut T` reborrowed from
/// the same pointer, which is sound under the usual recursive-mutex
/// discipline as long as a caller never retains the `&mut T` past the
/// `.with()` call that produced it — exactly what the closure-scoped API
/// enforces.
pub struct ReentrantLock<T> {
    inner: ReentrantMutex<UnsafeCell<T>>,
}

// Safety: `ReentrantMutex` only lets one logical call chain (one thread,
// possibly nested) hold the lock at a time; `Send`/`Sync` of the protected
// value is exactly what's needed for that to be sound across threads.
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub const fn new(value: T) -> Self
    where
        T: 'static,
    {
        Self {
            inner: ReentrantMutex::new(UnsafeCell::new(value)),
        }
    }

    /// Runs `f` with exclusive (but re-entrant) access to the protected
    /// value. Safe to call again from within `f` on the same thread — but
    /// only after the outer call's `&mut T` has gone out of scope first;
    /// holding it live across a nested `.with()` call produces two `&mut T`
    /// reborrows of the same `UnsafeCell` at once, which this lock's
    /// re-entry discipline does not permit even when the outer reference is
    /// never read again. Callers that need to recurse should thread the
    /// `&mut T` they already hold into the inner operation instead of
    /// calling `.with()` a second time.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.inner.lock();
        let value = unsafe { &mut *guard.get() };
        f(value)
    }
}

#[cfg(test)]
mod tests {
    use super::ReentrantLock;

    #[test]
    fn reentrant_access_from_same_thread() {
        let lock = ReentrantLock::new(0u32);
        lock.with(|outer| {
            *outer += 1;
            lock.with(|inner| {
                *inner += 1;
            });
        });
        lock.with(|v| assert_eq!(*v, 2));
    }

    #[test]
    fn excludes_other_threads() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(ReentrantLock::new(Vec::<u32>::new()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                lock.with(|v| v.push(i));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        lock.with(|v| assert_eq!(v.len(), 8));
    }
}
