// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integrity-violation reporting for the memory subsystems.
//!
//! The heap and stack-guard crates never panic on detecting corruption or
//! misuse; they refuse the operation and *report*. This crate is the funnel
//! for those reports. A report does two things:
//!
//! 1. bumps a per-kind event counter, so "how often has this fired" can be
//!    answered from a debugger without any hook installed, and
//! 2. invokes the embedder's hook, if one is registered.
//!
//! Counters are plain `AtomicU32`s in a `static` array, one per [`Violation`]
//! variant, so they survive in RAM at a fixed symbol and can be watched live.
//! The hook lives behind a `critical_section::Mutex`, which makes
//! registration and dispatch sound from thread, scheduler, and fault-handler
//! context alike.
//!
//! [`raise`] must stay callable from a memory-management fault handler: it
//! takes no locks other than the critical section, allocates nothing, and
//! never panics.

#![cfg_attr(not(test), no_std)]

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::Mutex;

/// Every refusal the memory subsystems can report, across all of them.
///
/// The variants are deliberately one flat namespace: the embedder wires a
/// single hook and switches on the kind, the way a single assert macro would
/// have been used in a C rendition of this library.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Violation {
    // Heap initialisation.
    InitInvalidSize,
    NotInitialized,

    // Allocation.
    OutOfMemory,
    ZeroSizeAlloc,
    InvalidBlock,
    AllocOverlap,

    // Free.
    NullFree,
    FreePtrNotInHeap,
    FreeInvalidHeader,
    FreeInvalidBoundary,
    OutOfBoundWrite,
    DoubleFree,
    FreeOverlap,
    CoalesceNextInvalidCrc,
    CoalescePrevInvalidCrc,

    // MPU / stack guard.
    NoMpuAvailable,
    MpuNotEnabled,
    InvalidMpuAddress,
    InvalidStackAlignment,
    InvalidRegionNumber,
    NoMpuRegionLeft,
    TaskNotFound,
    InvalidRegionSize,

    // Exclusion.
    MutexCreationFailed,
    MutexDeletionFailed,
    MutexIsNull,
    MutexAcquireFailed,
    MutexReleaseFailed,

    // Configuration.
    StrategyUnsupported,
}

impl Violation {
    /// Number of distinct kinds; sizes the counter array.
    pub const COUNT: usize = 29;

    /// Stable human-readable message handed to the hook alongside the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Violation::InitInvalidSize => "heap init: invalid arena size",
            Violation::NotInitialized => "heap not initialized",
            Violation::OutOfMemory => "allocation failed: out of memory",
            Violation::ZeroSizeAlloc => "allocation of size zero",
            Violation::InvalidBlock => "walked block failed CRC check",
            Violation::AllocOverlap => "allocate re-entered while busy",
            Violation::NullFree => "free of null pointer",
            Violation::FreePtrNotInHeap => "freed pointer not in heap",
            Violation::FreeInvalidHeader => "freed block header failed CRC",
            Violation::FreeInvalidBoundary => {
                "freed block boundary failed CRC (out-of-bound write from a \
                 later block?)"
            }
            Violation::OutOfBoundWrite => "write past requested size detected",
            Violation::DoubleFree => "block freed twice",
            Violation::FreeOverlap => "free re-entered while busy",
            Violation::CoalesceNextInvalidCrc => {
                "next block failed CRC during coalescing"
            }
            Violation::CoalescePrevInvalidCrc => {
                "previous block failed CRC during coalescing"
            }
            Violation::NoMpuAvailable => "no MPU regions reported by hardware",
            Violation::MpuNotEnabled => "MPU is not enabled",
            Violation::InvalidMpuAddress => "region base address invalid",
            Violation::InvalidStackAlignment => {
                "stack base not aligned for region size"
            }
            Violation::InvalidRegionNumber => "MPU region number out of range",
            Violation::NoMpuRegionLeft => "all MPU regions in use",
            Violation::TaskNotFound => "task has no registered region",
            Violation::InvalidRegionSize => "region size not representable",
            Violation::MutexCreationFailed => "mutex creation failed",
            Violation::MutexDeletionFailed => "mutex deletion failed",
            Violation::MutexIsNull => "mutex handle is null",
            Violation::MutexAcquireFailed => "mutex acquire failed",
            Violation::MutexReleaseFailed => "mutex release failed",
            Violation::StrategyUnsupported => {
                "allocation strategy not supported"
            }
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Receiver for violation reports. Called with the kind and its message.
///
/// The hook may be invoked from interrupt or fault context; it must not
/// block and must not call back into the reporting subsystem.
pub type Hook = fn(Violation, &'static str);

static HOOK: Mutex<Cell<Option<Hook>>> = Mutex::new(Cell::new(None));

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU32 = AtomicU32::new(0);
static EVENTS: [AtomicU32; Violation::COUNT] = [ZERO; Violation::COUNT];

/// Installs `hook` as the report receiver, replacing any previous one.
pub fn set_hook(hook: Hook) {
    critical_section::with(|cs| HOOK.borrow(cs).set(Some(hook)));
}

/// Removes the installed hook, if any.
pub fn clear_hook() {
    critical_section::with(|cs| HOOK.borrow(cs).set(None));
}

/// Reports a violation: bumps its counter and dispatches to the hook.
pub fn raise(kind: Violation) {
    EVENTS[kind.index()].fetch_add(1, Ordering::Relaxed);
    let hook = critical_section::with(|cs| HOOK.borrow(cs).get());
    if let Some(hook) = hook {
        hook(kind, kind.as_str());
    }
}

/// Number of times `kind` has been raised since boot (or the last
/// [`reset_counts`]).
pub fn count(kind: Violation) -> u32 {
    EVENTS[kind.index()].load(Ordering::Relaxed)
}

/// Clears all event counters. Intended for tests.
pub fn reset_counts() {
    for slot in &EVENTS {
        slot.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // The hook is a process-wide static and tests run concurrently, so every
    // test that installs one funnels through the same recorder.
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn recorder(_kind: Violation, msg: &'static str) {
        assert!(!msg.is_empty());
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn raise_without_hook_only_counts() {
        let before = count(Violation::DoubleFree);
        raise(Violation::DoubleFree);
        assert_eq!(count(Violation::DoubleFree), before + 1);
    }

    #[test]
    fn hook_receives_reports() {
        set_hook(recorder);
        let before = CALLS.load(Ordering::SeqCst);
        raise(Violation::OutOfMemory);
        assert!(CALLS.load(Ordering::SeqCst) > before);
        clear_hook();
    }

    #[test]
    fn counters_are_per_kind() {
        let oob = count(Violation::OutOfBoundWrite);
        let nul = count(Violation::NullFree);
        raise(Violation::OutOfBoundWrite);
        assert_eq!(count(Violation::OutOfBoundWrite), oob + 1);
        assert!(count(Violation::NullFree) >= nul);
    }

    #[test]
    fn count_constant_matches_variants() {
        // The last variant must index the last counter slot.
        assert_eq!(
            Violation::StrategyUnsupported.index(),
            Violation::COUNT - 1
        );
    }

    #[test]
    fn messages_are_distinct_enough() {
        assert_ne!(
            Violation::FreeInvalidHeader.as_str(),
            Violation::FreeInvalidBoundary.as_str()
        );
    }
}
