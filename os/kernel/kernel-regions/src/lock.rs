//! Ticket-ordered spin lock guarding a map's chain.
//!
//! Every [`RegionMap`](crate::RegionMap) operation runs as one short critical
//! section. Waiters are served in arrival order so a core hammering
//! `allocate` cannot starve a core trying to `free`.

use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

pub struct MapLock<T> {
    /// Next ticket to hand out.
    next: AtomicUsize,
    /// Ticket currently allowed into the critical section.
    serving: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for MapLock<T> {}
unsafe impl<T: Send> Send for MapLock<T> {}

impl<T> MapLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            next: AtomicUsize::new(0),
            serving: AtomicUsize::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Take a ticket and spin until it is served.
    #[inline]
    pub fn lock(&self) -> MapLockGuard<'_, T> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        MapLockGuard { lock: self }
    }

    /// Try once; succeeds only if nobody holds or waits for the lock.
    #[inline]
    pub fn try_lock(&self) -> Option<MapLockGuard<'_, T>> {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| MapLockGuard { lock: self })
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Whether some context currently holds the lock (racy, diagnostics only).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct MapLockGuard<'a, T> {
    lock: &'a MapLock<T>,
}

impl<T> Deref for MapLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for MapLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for MapLockGuard<'_, T> {
    fn drop(&mut self) {
        // Only the holder advances `serving`, so a plain load is enough.
        let t = self.lock.serving.load(Ordering::Relaxed);
        self.lock.serving.store(t.wrapping_add(1), Ordering::Release);
    }
}
