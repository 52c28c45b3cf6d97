// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit-serial CRC routines for integrity tags.
//!
//! This crate computes CRC-16 and CRC-32 checksums one input byte at a time,
//! MSB first, with no input or output reflection. There are no lookup tables:
//! the expected users hash 6..10-byte metadata records on allocator hot
//! paths, where a 512-byte table per polynomial costs more flash than the
//! eight shifts cost cycles.
//!
//! The algorithm parameters are plain data rather than type-level constants,
//! so a deployment can run a house polynomial if it needs to. The two
//! parameter sets actually used by the memory-integrity crates are exported
//! as [`CRC16_CCITT_FALSE`] and [`CRC32_BZIP2`].
//!
//! Checksums here are load-bearing: a tag written with one build of this
//! crate must verify under any other. Byte-for-byte reproducibility is the
//! contract, and the tests pin it against published check values and an
//! independent table-driven implementation.

#![cfg_attr(not(test), no_std)]

/// Parameters of an MSB-first, non-reflected CRC.
///
/// `W` is the accumulator width (`u16` or `u32`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Algorithm<W> {
    /// Generator polynomial, normal (MSB-first) representation, implicit
    /// leading 1.
    pub poly: W,
    /// Initial accumulator value.
    pub init: W,
    /// Value XORed into the accumulator after the last input byte.
    pub xorout: W,
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, seed 0xFFFF, no final XOR.
pub const CRC16_CCITT_FALSE: Algorithm<u16> = Algorithm {
    poly: 0x1021,
    init: 0xFFFF,
    xorout: 0x0000,
};

/// CRC-32/BZIP2: polynomial 0x04C11DB7, seed and final XOR all-ones. This is
/// the non-reflected sibling of the ubiquitous zlib CRC.
pub const CRC32_BZIP2: Algorithm<u32> = Algorithm {
    poly: 0x04C1_1DB7,
    init: 0xFFFF_FFFF,
    xorout: 0xFFFF_FFFF,
};

/// Computes the CRC-16 of `bytes` under `alg` in one call.
pub fn crc16(alg: &Algorithm<u16>, bytes: &[u8]) -> u16 {
    let mut d = Digest16::new(alg);
    d.update(bytes);
    d.finalize()
}

/// Computes the CRC-32 of `bytes` under `alg` in one call.
pub fn crc32(alg: &Algorithm<u32>, bytes: &[u8]) -> u32 {
    let mut d = Digest32::new(alg);
    d.update(bytes);
    d.finalize()
}

/// Incremental CRC-16 state, for callers hashing a record that lives in
/// discontiguous pieces.
#[derive(Copy, Clone, Debug)]
pub struct Digest16 {
    acc: u16,
    poly: u16,
    xorout: u16,
}

impl Digest16 {
    pub const fn new(alg: &Algorithm<u16>) -> Self {
        Self {
            acc: alg.init,
            poly: alg.poly,
            xorout: alg.xorout,
        }
    }

    /// Folds `bytes` into the accumulator.
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            // XOR the next byte into the top of the accumulator, then clock
            // out eight bits: shift left, and fold in the polynomial
            // whenever the discarded bit was set.
            self.acc ^= u16::from(b) << 8;
            for _ in 0..8 {
                let carry = self.acc & 0x8000 != 0;
                self.acc <<= 1;
                if carry {
                    self.acc ^= self.poly;
                }
            }
        }
    }

    /// Applies the final XOR and returns the checksum. The digest may keep
    /// being updated afterwards; `finalize` does not consume the state.
    pub const fn finalize(&self) -> u16 {
        self.acc ^ self.xorout
    }
}

/// Incremental CRC-32 state.
#[derive(Copy, Clone, Debug)]
pub struct Digest32 {
    acc: u32,
    poly: u32,
    xorout: u32,
}

impl Digest32 {
    pub const fn new(alg: &Algorithm<u32>) -> Self {
        Self {
            acc: alg.init,
            poly: alg.poly,
            xorout: alg.xorout,
        }
    }

    /// Folds `bytes` into the accumulator.
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.acc ^= u32::from(b) << 24;
            for _ in 0..8 {
                let carry = self.acc & 0x8000_0000 != 0;
                self.acc <<= 1;
                if carry {
                    self.acc ^= self.poly;
                }
            }
        }
    }

    pub const fn finalize(&self) -> u32 {
        self.acc ^ self.xorout
    }
}
