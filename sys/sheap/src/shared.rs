// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared-heap facade: a [`SecureHeap`] behind a [`RawMutex`].
//!
//! The core allocator relies on `&mut self` for exclusion, which is the
//! right thing exactly until the heap must be reachable from more than one
//! context. This wrapper owns the heap inside an [`oslock::Lock`], takes
//! `&self` everywhere, and converts acquisition failures into the
//! allocator's own error vocabulary: a `Busy` lock is an overlapped call
//! (an interrupt re-entered the allocator), a timeout is a mutex-acquire
//! failure. Pick the mutex to match the deployment -- an RTOS binding's
//! `RawMutex`, [`oslock::IrqMask`] for task-plus-interrupt sharing, or
//! [`oslock::BusyFlag`] for a no-OS build that only wants re-entry
//! detection.
//!
//! Every entry point acquires and releases inside one `Lock::with` call,
//! so no return path can exit with the mutex held.

use core::ptr::NonNull;

use oslock::{Lock, LockError, RawMutex, WaitBudget};
use tripwire::{raise, Violation};

use crate::heap::{
    AllocError, AuditError, AuditReport, FreeError, HeapStats, SecureHeap,
};

pub struct SharedHeap<'a, M: RawMutex, const LOG: usize = 16> {
    inner: Lock<M, SecureHeap<'a, LOG>>,
    wait: WaitBudget,
}

impl<'a, M: RawMutex, const LOG: usize> SharedHeap<'a, M, LOG> {
    /// Wraps `heap`; `wait` bounds every subsequent acquisition.
    pub const fn new(heap: SecureHeap<'a, LOG>, wait: WaitBudget) -> Self {
        Self {
            inner: Lock::new(heap),
            wait,
        }
    }

    pub fn allocate(
        &self,
        size: usize,
        id: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        match self.inner.with(self.wait, |h| h.allocate(size, id)) {
            Ok(r) => r,
            Err(e) => Err(alloc_lock_error(e)),
        }
    }

    pub fn allocate_filled(
        &self,
        count: usize,
        size: usize,
        id: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        match self
            .inner
            .with(self.wait, |h| h.allocate_filled(count, size, id))
        {
            Ok(r) => r,
            Err(e) => Err(alloc_lock_error(e)),
        }
    }

    pub fn free(&self, ptr: *mut u8, id: u32) -> Result<(), FreeError> {
        match self.inner.with(self.wait, |h| h.free(ptr, id)) {
            Ok(r) => r,
            Err(e) => Err(free_lock_error(e)),
        }
    }

    /// Read-side accessors also take the lock: statistics and audits read
    /// the same structures the mutators write.
    pub fn stats(&self) -> Result<HeapStats, LockError> {
        self.inner.with(self.wait, |h| h.stats())
    }

    pub fn latest_ids(&self, dest: &mut [u32]) -> Result<usize, LockError> {
        self.inner.with(self.wait, |h| h.latest_ids(dest))
    }

    pub fn audit(&self) -> Result<Result<AuditReport, AuditError>, LockError> {
        self.inner.with(self.wait, |h| h.audit())
    }

    /// Unwraps the facade, returning the heap.
    pub fn into_inner(self) -> SecureHeap<'a, LOG> {
        self.inner.into_inner()
    }
}

fn alloc_lock_error(e: LockError) -> AllocError {
    match e {
        LockError::Busy => {
            raise(Violation::AllocOverlap);
            AllocError::Busy
        }
        LockError::Timeout => {
            raise(Violation::MutexAcquireFailed);
            AllocError::Lock
        }
        LockError::Release => {
            raise(Violation::MutexReleaseFailed);
            AllocError::Lock
        }
    }
}

fn free_lock_error(e: LockError) -> FreeError {
    match e {
        LockError::Busy => {
            raise(Violation::FreeOverlap);
            FreeError::Busy
        }
        LockError::Timeout => {
            raise(Violation::MutexAcquireFailed);
            FreeError::Lock
        }
        LockError::Release => {
            raise(Violation::MutexReleaseFailed);
            FreeError::Lock
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oslock::SpinWait;

    /// A mutex that never grants: exercises the error mapping without
    /// having to stage a real interrupt.
    struct Refuses(LockError);

    impl RawMutex for Refuses {
        const INIT: Self = Refuses(LockError::Busy);

        fn try_lock(&self, _wait: WaitBudget) -> Result<(), LockError> {
            Err(self.0)
        }

        fn unlock(&self) -> Result<(), LockError> {
            Ok(())
        }
    }

    #[test]
    fn operations_work_through_the_facade() {
        let mut mem = vec![0u8; 1024];
        let heap = SecureHeap::new(&mut mem).unwrap();
        let shared: SharedHeap<'_, SpinWait> =
            SharedHeap::new(heap, WaitBudget::NONE);

        let p = shared.allocate(64, 1).unwrap();
        assert_eq!(shared.stats().unwrap().live_allocations, 1);
        shared.free(p.as_ptr(), 2).unwrap();
        assert_eq!(shared.stats().unwrap().live_allocations, 0);
        shared.audit().unwrap().unwrap();
    }

    #[test]
    fn contended_lock_maps_to_overlap() {
        let mut mem = vec![0u8; 256];
        let heap = SecureHeap::new(&mut mem).unwrap();
        let shared: SharedHeap<'_, Refuses> =
            SharedHeap::new(heap, WaitBudget::NONE);

        let overlaps = tripwire::count(Violation::AllocOverlap);
        assert_eq!(shared.allocate(8, 1).err(), Some(AllocError::Busy));
        assert_eq!(tripwire::count(Violation::AllocOverlap), overlaps + 1);

        let p = core::ptr::null_mut();
        assert_eq!(shared.free(p, 1).err(), Some(FreeError::Busy));
    }

    #[test]
    fn timed_out_lock_maps_to_acquire_failure() {
        struct TimesOut;
        impl RawMutex for TimesOut {
            const INIT: Self = TimesOut;
            fn try_lock(&self, _w: WaitBudget) -> Result<(), LockError> {
                Err(LockError::Timeout)
            }
            fn unlock(&self) -> Result<(), LockError> {
                Ok(())
            }
        }

        let mut mem = vec![0u8; 256];
        let heap = SecureHeap::new(&mut mem).unwrap();
        let shared: SharedHeap<'_, TimesOut> =
            SharedHeap::new(heap, WaitBudget(10));
        assert_eq!(shared.allocate(8, 1).err(), Some(AllocError::Lock));
    }
}
