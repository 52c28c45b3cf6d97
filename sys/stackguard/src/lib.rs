// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task stack-overflow detection on the ARMv7-M MPU.
//!
//! Each registered task gets one MPU region covering its stack. On every
//! task switch the whole region set is reprogrammed: the incoming task's
//! region becomes read-write, every other task's region drops to the
//! configured switch-out permission (no access, by default). A task that
//! overruns its own stack into a neighbour's therefore takes an immediate,
//! precise memory-management fault instead of silently shredding someone
//! else's state.
//!
//! The crate divides along the same line as the MPU driver it sits on: the
//! region *table* -- registration, removal, and the per-switch permission
//! image -- is portable, host-tested logic; actually touching the MPU and
//! the fault vector only exists under the `armv7m` cfg.
//!
//! # Sharing and the scheduler path
//!
//! [`StackGuard`]'s mutators take `&mut self`. When registration calls can
//! race the scheduler, put the guard behind a lock and keep interrupts out
//! of the critical section:
//!
//! ```
//! use oslock::{Lock, SpinWait, WaitBudget};
//! use stackguard::{SharedGuard, StackGuard};
//!
//! let guard: SharedGuard<SpinWait, 8> =
//!     Lock::new(StackGuard::new(8).unwrap());
//! guard
//!     .with(WaitBudget::FOREVER, |g| {
//!         g.add_task_byte_size(7, 0x2000_0000, 1024, Default::default())
//!     })
//!     .unwrap()
//!     .unwrap();
//! ```
//!
//! [`StackGuard::switch_in_image`] takes `&self` and is the only thing the
//! task-switch hook needs; it runs inside the scheduler's critical
//! section, where mutators cannot preempt it, so the hot path takes no
//! lock. The MPU registers are re-derived from the table on every switch --
//! an interrupted switch-in is simply re-run against whichever table
//! version it observes, never leaving a half-programmed MPU (regions are
//! only loaded with the MPU disabled).

#![cfg_attr(not(test), no_std)]

pub mod fault;

use armv7_m_mpu::{
    encode, AccessPerm, MpuError, RegionAttributes, RegionConfig, RegionPair,
    SizeCode,
};
use tripwire::{raise, Violation};

/// The v7-M RBAR region field caps a table at 16 slots regardless of what
/// the hardware reports.
const ARCH_MAX_REGIONS: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GuardError {
    /// Hardware reports zero MPU regions.
    NoMpuAvailable,
    /// Every usable region slot is taken.
    NoMpuRegionLeft,
    /// Stack base violates the 32-byte floor.
    InvalidMpuAddress,
    /// Stack base is not naturally aligned to the region size.
    InvalidStackAlignment,
    /// Region index outside what the architecture can express.
    InvalidRegionNumber,
    /// Size is not an expressible region size (power of two, ≥ 32 bytes).
    InvalidRegionSize,
    /// No region is registered for that task.
    TaskNotFound,
    /// The MPU is off although tasks are registered.
    MpuNotEnabled,
}

/// Attributes for a registered stack region, beyond its base and size.
///
/// Defaults are the ones every ordinary task stack wants: cacheable,
/// shareable, not bufferable, standard TEX, no instruction fetches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskAttributes {
    /// Permission the region carries while its task is the running one.
    pub run_access: AccessPerm,
    pub execute_never: bool,
}

impl Default for TaskAttributes {
    fn default() -> Self {
        Self {
            run_access: AccessPerm::ReadWrite,
            execute_never: true,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct TaskRegion {
    task: u32,
    region: RegionConfig,
}

/// The region table. `R` is the software ceiling on regions; the usable
/// count is the smaller of `R`, the hardware's report, and the
/// architectural 16.
pub struct StackGuard<const R: usize> {
    table: [Option<TaskRegion>; R],
    /// Lowest-index empty slot, so registration is O(1) in the common
    /// case. May point below the first empty slot, never above it.
    next_unused: usize,
    hw_regions: u8,
    /// Permission every non-running task's region falls to.
    switch_out: AccessPerm,
}

impl<const R: usize> StackGuard<R> {
    /// Builds an empty table for an MPU with `hw_regions` regions, denying
    /// all access to switched-out stacks.
    pub fn new(hw_regions: u8) -> Result<Self, GuardError> {
        Self::with_switch_out(hw_regions, AccessPerm::NoAccess)
    }

    /// As [`Self::new`], with an explicit switch-out permission (e.g.
    /// [`AccessPerm::PrivOnly`] to let a privileged monitor keep reading
    /// sleeping tasks' stacks).
    pub fn with_switch_out(
        hw_regions: u8,
        switch_out: AccessPerm,
    ) -> Result<Self, GuardError> {
        if hw_regions == 0 {
            raise(Violation::NoMpuAvailable);
            return Err(GuardError::NoMpuAvailable);
        }
        Ok(Self {
            table: [None; R],
            next_unused: 0,
            hw_regions,
            switch_out,
        })
    }

    /// Usable region slots.
    pub fn capacity(&self) -> usize {
        R.min(self.hw_regions as usize).min(ARCH_MAX_REGIONS)
    }

    /// Registered tasks.
    pub fn occupied(&self) -> usize {
        self.table.iter().filter(|s| s.is_some()).count()
    }

    /// Registers `task`'s stack region, or reprograms it if the task is
    /// already registered. Returns the slot index.
    ///
    /// The region is validated in full before the table is touched: a
    /// refused registration leaves no trace.
    pub fn add_task(
        &mut self,
        task: u32,
        stack_base: u32,
        size: SizeCode,
        attrs: TaskAttributes,
    ) -> Result<usize, GuardError> {
        let mut region_attrs =
            RegionAttributes::CACHEABLE | RegionAttributes::SHAREABLE;
        if attrs.execute_never {
            region_attrs |= RegionAttributes::EXECUTE_NEVER;
        }
        let region = RegionConfig {
            base: stack_base,
            size,
            ap: attrs.run_access,
            tex: 0b000,
            attrs: region_attrs,
        };

        let slot = match self.slot_of(task) {
            Some(i) => i,
            None => {
                let i = self.next_unused;
                if i >= self.capacity() {
                    raise(Violation::NoMpuRegionLeft);
                    return Err(GuardError::NoMpuRegionLeft);
                }
                i
            }
        };
        // Validation happens against the slot the entry would land in;
        // only after it passes does anything get written.
        if let Err(e) = encode(slot, &region) {
            return Err(report_mpu_error(e));
        }

        self.table[slot] = Some(TaskRegion { task, region });
        if slot == self.next_unused {
            self.advance_next_unused();
        }
        Ok(slot)
    }

    /// Registration by stack size in bytes; the size must be a power of
    /// two (the MPU cannot express anything else).
    pub fn add_task_byte_size(
        &mut self,
        task: u32,
        stack_base: u32,
        stack_bytes: u32,
        attrs: TaskAttributes,
    ) -> Result<usize, GuardError> {
        let size = match SizeCode::from_byte_size(stack_bytes) {
            Ok(s) => s,
            Err(e) => return Err(report_mpu_error(e)),
        };
        self.add_task(task, stack_base, size, attrs)
    }

    /// Unregisters `task` and makes its slot the preferred next claim if
    /// it is the lowest empty one.
    pub fn remove_task(&mut self, task: u32) -> Result<(), GuardError> {
        match self.slot_of(task) {
            Some(i) => {
                self.table[i] = None;
                if i < self.next_unused {
                    self.next_unused = i;
                }
                Ok(())
            }
            None => {
                raise(Violation::TaskNotFound);
                Err(GuardError::TaskNotFound)
            }
        }
    }

    /// Slot index and registered region for `task`.
    pub fn region_of(&self, task: u32) -> Option<(usize, RegionConfig)> {
        self.slot_of(task)
            .map(|i| (i, self.table[i].as_ref().unwrap().region))
    }

    /// Computes the register image for switching `task` in: its region at
    /// its run permission, every other occupied region at the switch-out
    /// permission, geometry and memory attributes untouched. Empty slots
    /// stay `None` (they are loaded as disabled regions).
    ///
    /// This is the scheduler hot path; it reads the table and writes
    /// nothing.
    pub fn switch_in_image(&self, task: u32) -> [Option<RegionPair>; R] {
        let mut image = [None; R];
        for (i, slot) in self.table.iter().enumerate() {
            if let Some(entry) = slot {
                let cfg = RegionConfig {
                    ap: if entry.task == task {
                        entry.region.ap
                    } else {
                        self.switch_out
                    },
                    ..entry.region
                };
                // The config was validated on registration and i is within
                // the architectural range, so this cannot fail; a None
                // here would leave the region disabled and the task
                // faulting on its own stack, which is loud.
                image[i] = encode(i, &cfg).ok();
            }
        }
        image
    }

    fn slot_of(&self, task: u32) -> Option<usize> {
        self.table
            .iter()
            .position(|s| matches!(s, Some(e) if e.task == task))
    }

    fn advance_next_unused(&mut self) {
        while self.next_unused < R && self.table[self.next_unused].is_some() {
            self.next_unused += 1;
        }
    }
}

/// A [`StackGuard`] behind an [`oslock`] lock, for deployments where
/// registration calls can race each other. The scheduler hot path should
/// not go through this -- see the crate docs.
pub type SharedGuard<M, const R: usize> = oslock::Lock<M, StackGuard<R>>;

fn report_mpu_error(e: MpuError) -> GuardError {
    match e {
        MpuError::InvalidAddress => {
            raise(Violation::InvalidMpuAddress);
            GuardError::InvalidMpuAddress
        }
        MpuError::InvalidAlignment => {
            raise(Violation::InvalidStackAlignment);
            GuardError::InvalidStackAlignment
        }
        MpuError::InvalidRegionNumber => {
            raise(Violation::InvalidRegionNumber);
            GuardError::InvalidRegionNumber
        }
        MpuError::InvalidSize => {
            raise(Violation::InvalidRegionSize);
            GuardError::InvalidRegionSize
        }
    }
}

#[cfg(armv7m)]
mod hw {
    use super::*;
    use armv7_m_mpu as mpu;
    use cortex_m::peripheral::mpu::RegisterBlock;

    impl<const R: usize> StackGuard<R> {
        /// Brings the guard up against real hardware: MPU off, region
        /// count read from MPU_TYPE, fault hook registered.
        pub fn init(
            mpu_regs: &RegisterBlock,
            hook: Option<crate::fault::MemFaultHook>,
        ) -> Result<Self, GuardError> {
            // Safety: disabling the MPU cannot violate memory safety; it
            // only widens what the current privilege level may touch.
            unsafe { mpu::disable(mpu_regs) };
            if let Some(h) = hook {
                crate::fault::set_hook(h);
            }
            Self::new(mpu::region_count(mpu_regs))
        }

        /// The task-switch hook. Loads the switch-in image for `task` and
        /// re-enables the MPU if `enable` is set.
        ///
        /// Must be the only writer of the MPU registers in the scheduler
        /// path, and must run with task switching held off (it is expected
        /// to *be* part of the switch).
        pub fn task_switch_in(
            &self,
            mpu_regs: &RegisterBlock,
            task: u32,
            enable: bool,
        ) {
            // Safety: regions may only be loaded with the MPU disabled;
            // the barriers inside disable/enable order the transition
            // against surrounding accesses.
            unsafe {
                mpu::disable(mpu_regs);
                for (i, slot) in self.switch_in_image(task).iter().enumerate()
                {
                    let pair = match (slot, armv7_m_mpu::disabled(i)) {
                        (Some(p), _) => *p,
                        (None, Ok(off)) => off,
                        // Slots past the architectural limit don't exist.
                        (None, Err(_)) => continue,
                    };
                    mpu::load(mpu_regs, pair);
                }
                if enable {
                    mpu::enable(mpu_regs, true);
                }
            }
        }

        /// Turns stack protection on (privileged code keeps the default
        /// map as background).
        pub fn guard(&self, mpu_regs: &RegisterBlock) {
            // Safety: enabling protection can only make accesses fault,
            // never corrupt.
            unsafe { mpu::enable(mpu_regs, true) };
        }

        /// Verifies the MPU is actually on when the table says it should
        /// be.
        pub fn check(&self, mpu_regs: &RegisterBlock) -> Result<(), GuardError> {
            if self.occupied() > 0 && !mpu::is_enabled(mpu_regs) {
                raise(Violation::MpuNotEnabled);
                return Err(GuardError::MpuNotEnabled);
            }
            Ok(())
        }
    }
}
