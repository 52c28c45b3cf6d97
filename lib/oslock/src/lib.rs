// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusion seam between the memory subsystems and whatever is scheduling
//! the processor.
//!
//! The heap and region-table crates need mutual exclusion, but what that
//! means depends entirely on the deployment: an RTOS mutex when there is an
//! RTOS, masking interrupts when there isn't, a spinlock on a threaded host
//! running the test suite. [`RawMutex`] is the seam; the RTOS binding
//! implements it for its own mutex handle, and three implementations ship
//! here for the other cases.
//!
//! Access always goes through [`Lock::with`], which acquires, runs a
//! closure against the protected value, and releases in exactly one place.
//! There is no guard object to leak and no early-return path that can exit
//! with the mutex still held.

#![cfg_attr(not(test), no_std)]

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, Ordering};

/// How long an acquisition may wait before giving up.
///
/// The unit is implementation-defined: RTOS ticks for an RTOS mutex,
/// spin attempts for [`SpinWait`]. [`BusyFlag`] never waits at all.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WaitBudget(pub u32);

impl WaitBudget {
    /// Fail immediately if the lock is contended.
    pub const NONE: Self = Self(0);
    /// Wait indefinitely.
    pub const FOREVER: Self = Self(u32::MAX);
}

/// Acquisition or release failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockError {
    /// The lock is already held and this implementation does not wait --
    /// which, for the in-crate implementations, means the caller re-entered
    /// a section it is already inside (typically from an interrupt).
    Busy,
    /// The wait budget ran out before the lock could be taken.
    Timeout,
    /// Release failed; the protected operation itself completed.
    Release,
}

/// A raw mutual-exclusion primitive.
///
/// # Contract for implementers
///
/// - `try_lock` returning `Ok(())` grants exclusive ownership until the
///   matching `unlock`.
/// - `unlock` is only called after a successful `try_lock` (the [`Lock`]
///   wrapper maintains this pairing).
/// - Implementations must be callable from every context the platform
///   allows to share the lock; an implementation that is only sound with
///   interrupts masked must say so.
pub trait RawMutex {
    /// Unlocked initial state, for placing locks in `static`s.
    const INIT: Self;

    fn try_lock(&self, wait: WaitBudget) -> Result<(), LockError>;
    fn unlock(&self) -> Result<(), LockError>;
}

/// Spinning lock for hosts with real parallelism (or an RTOS-less SMP
/// target). One failed attempt consumes one unit of the wait budget.
pub struct SpinWait {
    inner: spin::Mutex<()>,
}

impl RawMutex for SpinWait {
    const INIT: Self = Self {
        inner: spin::Mutex::new(()),
    };

    fn try_lock(&self, wait: WaitBudget) -> Result<(), LockError> {
        let mut remaining = wait.0;
        loop {
            if let Some(guard) = self.inner.try_lock() {
                // Hold the lock past the guard's lifetime; `unlock` undoes
                // this via `force_unlock`.
                core::mem::forget(guard);
                return Ok(());
            }
            if wait != WaitBudget::FOREVER {
                if remaining == 0 {
                    return Err(if wait == WaitBudget::NONE {
                        LockError::Busy
                    } else {
                        LockError::Timeout
                    });
                }
                remaining -= 1;
            }
            core::hint::spin_loop();
        }
    }

    fn unlock(&self) -> Result<(), LockError> {
        if !self.inner.is_locked() {
            return Err(LockError::Release);
        }
        // Safety: the Lock wrapper only calls unlock after a successful
        // try_lock by the same logical owner, so the mutex is held by us.
        unsafe { self.inner.force_unlock() };
        Ok(())
    }
}

/// Non-blocking re-entry detector for builds with no OS at all.
///
/// There is nothing to wait *for* on a single-threaded machine: if the flag
/// is set, the current call has interrupted the code that set it. The wait
/// budget is therefore ignored and contention reported immediately as
/// [`LockError::Busy`].
pub struct BusyFlag {
    held: AtomicBool,
}

impl RawMutex for BusyFlag {
    const INIT: Self = Self {
        held: AtomicBool::new(false),
    };

    fn try_lock(&self, _wait: WaitBudget) -> Result<(), LockError> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| LockError::Busy)
    }

    fn unlock(&self) -> Result<(), LockError> {
        if self.held.swap(false, Ordering::Release) {
            Ok(())
        } else {
            Err(LockError::Release)
        }
    }
}

/// Interrupt-masking lock: the critical section *is* the exclusion.
///
/// Single-core only. Re-entry cannot happen while the lock is held (the
/// interrupts that could cause it are masked); an attempt is still checked
/// for and reported, which catches NMI-context misuse.
pub struct IrqMask {
    token: Cell<Option<critical_section::RestoreState>>,
}

// Safety: the token cell is only written between critical_section::acquire
// and release, i.e. with interrupts masked on the single core this
// implementation supports.
unsafe impl Sync for IrqMask {}

impl RawMutex for IrqMask {
    const INIT: Self = Self {
        token: Cell::new(None),
    };

    fn try_lock(&self, _wait: WaitBudget) -> Result<(), LockError> {
        // Safety: paired with the release in `unlock` (or immediately below
        // on the re-entry path).
        let state = unsafe { critical_section::acquire() };
        if self.token.get().is_some() {
            // Safety: undoing the acquire above.
            unsafe { critical_section::release(state) };
            return Err(LockError::Busy);
        }
        self.token.set(Some(state));
        Ok(())
    }

    fn unlock(&self) -> Result<(), LockError> {
        match self.token.take() {
            // Safety: `state` came from the acquire in `try_lock`.
            Some(state) => {
                unsafe { critical_section::release(state) };
                Ok(())
            }
            None => Err(LockError::Release),
        }
    }
}

/// A value protected by a [`RawMutex`], accessed only through scoped
/// closures.
pub struct Lock<M, T> {
    raw: M,
    value: UnsafeCell<T>,
}

// Safety: all access to `value` is serialized by `raw` per the RawMutex
// contract.
unsafe impl<M: RawMutex, T: Send> Sync for Lock<M, T> {}

impl<M: RawMutex, T> Lock<M, T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: M::INIT,
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock (waiting up to `wait`), runs `body` on the
    /// protected value, and releases.
    ///
    /// The release happens on every path out of this function; `body`
    /// cannot cause the lock to leak by returning early, because it has no
    /// access to the lock at all.
    pub fn with<R>(
        &self,
        wait: WaitBudget,
        body: impl FnOnce(&mut T) -> R,
    ) -> Result<R, LockError> {
        self.raw.try_lock(wait)?;
        // Safety: try_lock succeeded, so we have exclusive access until the
        // unlock below.
        let result = body(unsafe { &mut *self.value.get() });
        self.raw.unlock()?;
        Ok(result)
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}
