// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-management fault reception and decoding.
//!
//! When a guarded task trips over a region boundary, the processor takes
//! the MemManage exception with the offending address latched in MMFAR and
//! the cause bits in the MemManage byte of the CFSR. The vector below
//! selects the right stack pointer with the EXC_RETURN test, hands the
//! stacked eight-word frame to the Rust entry, and the entry decodes the
//! status and dispatches to whatever hook the embedder registered.
//!
//! Decoding is pure ([`decode`]) so the interpretation of CFSR/MMFAR pairs
//! is testable off-target; only the vector and the register reads live
//! under the `armv7m` cfg.

use core::cell::Cell;

use bitflags::bitflags;
use critical_section::Mutex;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

bitflags! {
    /// MemManage byte (bits 7:0) of the Configurable Fault Status
    /// Register.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Cfsr: u8 {
        /// Instruction access violation.
        const IACCVIOL = 1 << 0;
        /// Data access violation; MMFAR holds the address when
        /// MMARVALID is also set.
        const DACCVIOL = 1 << 1;
        // bit 2 reserved
        /// Fault while unstacking on exception return.
        const MUNSTKERR = 1 << 3;
        /// Fault while stacking for exception entry (the stack pointer
        /// itself is out of bounds).
        const MSTKERR = 1 << 4;
        /// Fault during lazy floating-point state preservation.
        const MLSPERR = 1 << 5;
        // bit 6 reserved
        /// MMFAR contains the faulting address.
        const MMARVALID = 1 << 7;
    }
}

/// The eight words the processor pushes on exception entry, oldest first.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, FromZeroes, FromBytes, AsBytes,
)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    /// Return address: the instruction that faulted (or the one after,
    /// for imprecise causes).
    pub pc: u32,
    pub xpsr: u32,
}

/// A decoded data-access violation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataFault {
    /// MMFAR contents when the hardware latched them, else zero.
    pub address: u32,
    /// Whether `address` is real (MMARVALID was set).
    pub address_valid: bool,
}

/// Receiver for data-access faults: `(fault_address, stacked_frame)`.
///
/// Runs in exception context. It must not allocate, block, or return to
/// the faulting code path's assumptions.
pub type MemFaultHook = fn(u32, &ExceptionFrame);

static HOOK: Mutex<Cell<Option<MemFaultHook>>> = Mutex::new(Cell::new(None));

/// Registers the fault hook, replacing any previous one.
pub fn set_hook(hook: MemFaultHook) {
    critical_section::with(|cs| HOOK.borrow(cs).set(Some(hook)));
}

pub fn clear_hook() {
    critical_section::with(|cs| HOOK.borrow(cs).set(None));
}

/// Interprets a CFSR/MMFAR pair. Only a data access violation -- the
/// signature of a task touching a region it has no permission for -- is a
/// guard event; everything else is left for the embedder's other fault
/// handling.
pub fn decode(status: Cfsr, mmfar: u32) -> Option<DataFault> {
    if !status.contains(Cfsr::DACCVIOL) {
        return None;
    }
    let address_valid = status.contains(Cfsr::MMARVALID);
    Some(DataFault {
        address: if address_valid { mmfar } else { 0 },
        address_valid,
    })
}

/// Decodes and, on a guard event, invokes the registered hook. Returns
/// whether a hook ran.
pub fn dispatch(status: Cfsr, mmfar: u32, frame: &ExceptionFrame) -> bool {
    let Some(fault) = decode(status, mmfar) else {
        return false;
    };
    let hook = critical_section::with(|cs| HOOK.borrow(cs).get());
    match hook {
        Some(hook) => {
            hook(fault.address, frame);
            true
        }
        None => false,
    }
}

#[cfg(armv7m)]
mod vector {
    use super::{dispatch, Cfsr, ExceptionFrame};

    // The MemManage vector proper. EXC_RETURN bit 2 says which stack the
    // frame went onto: handler-mode/MSP if clear, thread-mode/PSP if set.
    // The chosen pointer is the first argument to the Rust entry.
    core::arch::global_asm! {"
        .section .text.MemoryManagement
        .globl MemoryManagement
        .type MemoryManagement,function
        .cpu cortex-m4  @ least common denominator we support
        MemoryManagement:
            tst lr, #4
            ite eq
            mrseq r0, msp
            mrsne r0, psp
            b memory_management_entry
    "}

    /// Rust side of the vector.
    ///
    /// # Safety
    ///
    /// Implementation detail of the assembly handler above; not for
    /// calling from anywhere else.
    #[no_mangle]
    unsafe extern "C" fn memory_management_entry(
        frame: *const ExceptionFrame,
    ) {
        // Safety: shared reads of SCB registers from the fault handler;
        // the pointer from the cortex_m crate is valid by construction.
        let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
        let cfsr = scb.cfsr.read();
        let status = Cfsr::from_bits_truncate(cfsr as u8);
        let mmfar = scb.mmfar.read();

        // The status register is write-one-to-clear; writing back what we
        // read acknowledges exactly the conditions we observed.
        //
        // Safety: clearing sticky fault state, no memory-safety effect.
        unsafe { scb.cfsr.write(cfsr) };

        // Safety: the hardware stacked a full frame at the pointer the
        // assembly passed us; it stays valid for the handler's duration.
        let frame = unsafe { &*frame };

        if !dispatch(status, mmfar, frame) {
            // Nobody registered. If a debugger is attached, stop on the
            // spot rather than return into the fault loop.
            //
            // Safety: shared read of the Debug Halting Control and Status
            // Register.
            let dhcsr =
                unsafe { (*cortex_m::peripheral::DCB::PTR).dhcsr.read() };
            const C_DEBUGEN: u32 = 1 << 0;
            if dhcsr & C_DEBUGEN != 0 {
                cortex_m::asm::bkpt();
            }
        }
    }
}
