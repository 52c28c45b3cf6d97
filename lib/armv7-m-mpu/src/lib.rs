// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M MPU region arithmetic and register programming.
//!
//! The crate is split in two layers. The *portable* layer -- size codes,
//! access-permission encodings, alignment validation, RBAR/RASR packing --
//! is pure integer math and compiles (and is tested) on any target. The
//! *hardware* layer actually touches `cortex_m::peripheral::mpu::RegisterBlock`
//! and only exists under the `armv7m` cfg emitted by this crate's build
//! script.
//!
//! On v7-M the MPU expresses the size of a region in log2 form minus one:
//! the minimum region of 32 bytes is SIZE = 4, because `2**(4 + 1) == 32`.
//! A region's base address must be a multiple of its size ("natural"
//! alignment); that rule, not the 32-byte floor, is usually what bites.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

/// Errors from region validation and encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MpuError {
    /// Size is zero, not a power of two, below the 32-byte floor, or the
    /// size code is outside 0x04..=0x1F.
    InvalidSize,
    /// Base address violates the 32-byte floor.
    InvalidAddress,
    /// Base address is not naturally aligned to the region size.
    InvalidAlignment,
    /// Region index not supported by the v7-M RBAR REGION field.
    InvalidRegionNumber,
}

/// Encoded region size: region bytes = `2^(code + 1)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeCode(u8);

impl SizeCode {
    /// Smallest architecturally valid region, 32 bytes.
    pub const MIN: Self = Self(0x04);
    /// Largest, 4 GiB.
    pub const MAX: Self = Self(0x1F);

    pub const fn from_code(code: u8) -> Result<Self, MpuError> {
        if code >= Self::MIN.0 && code <= Self::MAX.0 {
            Ok(Self(code))
        } else {
            Err(MpuError::InvalidSize)
        }
    }

    /// Converts an exact byte count. The count must be a power of two of at
    /// least 32 bytes.
    pub const fn from_byte_size(bytes: u32) -> Result<Self, MpuError> {
        if bytes < 32 || !bytes.is_power_of_two() {
            return Err(MpuError::InvalidSize);
        }
        // log2(bytes) - 1; bytes is a power of two so trailing_zeros is
        // exact.
        Ok(Self((bytes.trailing_zeros() - 1) as u8))
    }

    pub const fn code(self) -> u8 {
        self.0
    }

    /// Region size in bytes. `u64` because code 0x1F means 4 GiB.
    pub const fn bytes(self) -> u64 {
        1u64 << (self.0 + 1)
    }
}

/// ARMv7-M AP field encodings.
///
/// The values are the literal 3-bit field contents; privileged here means
/// handler-mode/privileged-thread access, user means unprivileged thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessPerm {
    /// All accesses fault.
    NoAccess = 0b000,
    /// Privileged read-write, user faults.
    PrivOnly = 0b001,
    /// Privileged read-write, user read-only.
    PrivRwUserRo = 0b010,
    /// Read-write for everyone.
    ReadWrite = 0b011,
    /// Privileged read-only, user faults.
    PrivRo = 0b101,
    /// Read-only for everyone.
    ReadOnly = 0b110,
}

bitflags! {
    /// Memory-type attribute bits of the RASR (minus TEX, which is a
    /// 3-bit field and carried separately).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RegionAttributes: u8 {
        const BUFFERABLE = 1 << 0;
        const CACHEABLE = 1 << 1;
        const SHAREABLE = 1 << 2;
        const EXECUTE_NEVER = 1 << 3;
    }
}

/// Everything needed to program one region, in architecture-independent
/// form.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionConfig {
    pub base: u32,
    pub size: SizeCode,
    pub ap: AccessPerm,
    /// TEX field, 0..=7. Only the low three bits are used.
    pub tex: u8,
    pub attrs: RegionAttributes,
}

/// The RBAR/RASR register pair for one region, ready to load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionPair {
    pub rbar: u32,
    pub rasr: u32,
}

/// RBAR.VALID: honor the region number embedded in RBAR instead of RNR.
const RBAR_VALID: u32 = 1 << 4;
/// The v7-M RBAR REGION field is four bits.
const MAX_REGIONS: u32 = 16;

const RASR_ENABLE: u32 = 1 << 0;

/// Checks the architectural placement rules for a region base.
///
/// Both rules are enforced: the 32-byte floor on the address itself, and
/// natural alignment of the base to the region size.
pub const fn validate(base: u32, size: SizeCode) -> Result<(), MpuError> {
    if base & 0x1F != 0 {
        return Err(MpuError::InvalidAddress);
    }
    if (base as u64) & (size.bytes() - 1) != 0 {
        return Err(MpuError::InvalidAlignment);
    }
    Ok(())
}

/// Packs a region into its RBAR/RASR pair.
///
/// The produced RBAR carries the region number and the VALID bit, so the
/// pair can be loaded without a separate RNR write. The RASR has the enable
/// bit set; pairs are expected to be loaded with the MPU disabled.
pub const fn encode(
    index: usize,
    cfg: &RegionConfig,
) -> Result<RegionPair, MpuError> {
    if index as u32 >= MAX_REGIONS {
        return Err(MpuError::InvalidRegionNumber);
    }
    if let Err(e) = validate(cfg.base, cfg.size) {
        return Err(e);
    }

    let rbar = cfg.base | RBAR_VALID | index as u32;

    let xn = cfg.attrs.contains(RegionAttributes::EXECUTE_NEVER) as u32;
    let s = cfg.attrs.contains(RegionAttributes::SHAREABLE) as u32;
    let c = cfg.attrs.contains(RegionAttributes::CACHEABLE) as u32;
    let b = cfg.attrs.contains(RegionAttributes::BUFFERABLE) as u32;
    let rasr = xn << 28
        | (cfg.ap as u32) << 24
        | ((cfg.tex & 0b111) as u32) << 19
        | s << 18
        | c << 17
        | b << 16
        | (cfg.size.code() as u32) << 1
        | RASR_ENABLE;

    Ok(RegionPair { rbar, rasr })
}

/// The pair that leaves region `index` selected but disabled.
pub const fn disabled(index: usize) -> Result<RegionPair, MpuError> {
    if index as u32 >= MAX_REGIONS {
        return Err(MpuError::InvalidRegionNumber);
    }
    Ok(RegionPair {
        rbar: RBAR_VALID | index as u32,
        rasr: 0,
    })
}

#[cfg(armv7m)]
mod hw {
    use super::RegionPair;
    use cortex_m::peripheral::mpu::RegisterBlock;

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;

    /// Number of regions this MPU implements (MPU_TYPE.DREGION). Zero means
    /// no MPU is fitted.
    pub fn region_count(mpu: &RegisterBlock) -> u8 {
        (mpu._type.read() >> 8) as u8
    }

    /// Whether the MPU is currently enabled.
    pub fn is_enabled(mpu: &RegisterBlock) -> bool {
        mpu.ctrl.read() & ENABLE != 0
    }

    /// Disable the MPU ahead of reconfiguration.
    ///
    /// Any outstanding memory transactions must be forced to complete by
    /// executing a DMB instruction before the MPU is disabled and
    /// reprogrammed.
    pub unsafe fn disable(mpu: &RegisterBlock) {
        cortex_m::asm::dmb();
        mpu.ctrl.write(0);
    }

    /// Enable the MPU, optionally keeping the default memory map as a
    /// background region for privileged accesses.
    ///
    /// The trailing DMB ensures the register updates are seen by subsequent
    /// memory accesses, and the ISB ensures the updated configuration is
    /// used by subsequent instructions.
    pub unsafe fn enable(mpu: &RegisterBlock, privileged_default: bool) {
        let privdefena = if privileged_default { PRIVDEFENA } else { 0 };
        mpu.ctrl.write(ENABLE | privdefena);
        cortex_m::asm::dmb();
        cortex_m::asm::isb();
    }

    /// Load one region pair. Only legal with the MPU disabled: the pair is
    /// two registers, and there is no order of enabled-MPU writes that can't
    /// momentarily mix an old RBAR with a new RASR.
    pub unsafe fn load(mpu: &RegisterBlock, pair: RegionPair) {
        mpu.rbar.write(pair.rbar);
        mpu.rasr.write(pair.rasr);
    }
}

#[cfg(armv7m)]
pub use hw::{disable, enable, is_enabled, load, region_count};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_code_round_trips() {
        let c = SizeCode::from_byte_size(32).unwrap();
        assert_eq!(c.code(), 0x04);
        assert_eq!(c.bytes(), 32);

        let c = SizeCode::from_byte_size(1 << 20).unwrap();
        assert_eq!(c.code(), 19);
        assert_eq!(c.bytes(), 1 << 20);
    }

    #[test]
    fn size_code_rejects_non_power_of_two() {
        assert_eq!(SizeCode::from_byte_size(48), Err(MpuError::InvalidSize));
        assert_eq!(SizeCode::from_byte_size(0), Err(MpuError::InvalidSize));
        assert_eq!(SizeCode::from_byte_size(16), Err(MpuError::InvalidSize));
    }

    #[test]
    fn size_code_range_checked() {
        assert_eq!(SizeCode::from_code(0x03), Err(MpuError::InvalidSize));
        assert_eq!(SizeCode::from_code(0x20), Err(MpuError::InvalidSize));
        assert_eq!(SizeCode::from_code(0x1F).unwrap().bytes(), 1 << 32);
    }

    #[test]
    fn natural_alignment_enforced() {
        let k64 = SizeCode::from_byte_size(1 << 16).unwrap();
        assert_eq!(validate(0x2000_0000, k64), Ok(()));
        // 32-byte aligned but not 64 KiB aligned.
        assert_eq!(
            validate(0x2000_0020, k64),
            Err(MpuError::InvalidAlignment)
        );
        // Not even 32-byte aligned.
        assert_eq!(
            validate(0x2000_0004, SizeCode::MIN),
            Err(MpuError::InvalidAddress)
        );
    }

    #[test]
    fn encode_places_the_fields() {
        let cfg = RegionConfig {
            base: 0x2000_0000,
            size: SizeCode::MIN,
            ap: AccessPerm::ReadWrite,
            tex: 0b001,
            attrs: RegionAttributes::CACHEABLE
                | RegionAttributes::SHAREABLE
                | RegionAttributes::EXECUTE_NEVER,
        };
        let pair = encode(3, &cfg).unwrap();

        assert_eq!(pair.rbar, 0x2000_0000 | 1 << 4 | 3);
        // XN, AP=011, TEX=001, S, C, size code 4, enable.
        let expected_rasr = 1 << 28
            | 0b011 << 24
            | 0b001 << 19
            | 1 << 18
            | 1 << 17
            | (0x04 << 1)
            | 1;
        assert_eq!(pair.rasr, expected_rasr);
    }

    #[test]
    fn encode_rejects_bad_region_number() {
        let cfg = RegionConfig {
            base: 0,
            size: SizeCode::MIN,
            ap: AccessPerm::NoAccess,
            tex: 0,
            attrs: RegionAttributes::empty(),
        };
        assert!(encode(15, &cfg).is_ok());
        assert_eq!(encode(16, &cfg), Err(MpuError::InvalidRegionNumber));
    }

    #[test]
    fn encode_propagates_alignment_errors() {
        let cfg = RegionConfig {
            base: 0x2000_0100,
            size: SizeCode::from_byte_size(512).unwrap(),
            ap: AccessPerm::ReadWrite,
            tex: 0,
            attrs: RegionAttributes::empty(),
        };
        assert_eq!(encode(0, &cfg), Err(MpuError::InvalidAlignment));
    }

    #[test]
    fn disabled_pair_keeps_valid_and_index() {
        let pair = disabled(5).unwrap();
        assert_eq!(pair.rbar, 1 << 4 | 5);
        assert_eq!(pair.rasr, 0);
        assert_eq!(disabled(16), Err(MpuError::InvalidRegionNumber));
    }

    #[test]
    fn no_access_encoding_is_all_zero_ap() {
        let cfg = RegionConfig {
            base: 0x2000_0000,
            size: SizeCode::MIN,
            ap: AccessPerm::NoAccess,
            tex: 0,
            attrs: RegionAttributes::empty(),
        };
        let pair = encode(0, &cfg).unwrap();
        assert_eq!(pair.rasr >> 24 & 0b111, 0);
    }
}
