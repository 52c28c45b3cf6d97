// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block tags: the metadata record at both ends of every heap block.
//!
//! A block is `TAG | payload | TAG`, and the two tags are byte-identical.
//! The duplicate at the tail (the boundary tag) is what makes backward
//! coalescing possible without a free list, and it doubles as a tripwire:
//! the first byte past the payload is the first byte of the boundary, so
//! any overrun perturbs a CRC-sealed record.
//!
//! The in-arena layout is fixed little-endian regardless of host order,
//! which keeps a RAM dump readable and the CRC input well-defined:
//!
//! | field       | bits | notes                                   |
//! |-------------|------|-----------------------------------------|
//! | `size_word` | 32   | bit 31 = allocated, bits 30:0 = payload |
//! | `owner`     | 32   | extended layout only                    |
//! | `align_pad` | 16   | payload bytes beyond the requested size |
//! | `crc`       | 16   | CRC-16 over all preceding tag bytes     |

use soft_crc::{crc16, CRC16_CCITT_FALSE};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

type U16Le = zerocopy::byteorder::U16<zerocopy::byteorder::LittleEndian>;
type U32Le = zerocopy::byteorder::U32<zerocopy::byteorder::LittleEndian>;

/// Wire form of a tag, exactly as it sits in the arena.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromZeroes, FromBytes, AsBytes, Unaligned,
)]
#[repr(C)]
pub(crate) struct RawTag {
    size_word: U32Le,
    #[cfg(feature = "extended-header")]
    owner: U32Le,
    align_pad: U16Le,
    crc: U16Le,
}

/// Tag footprint in arena bytes.
pub(crate) const TAG_SIZE: usize = core::mem::size_of::<RawTag>();

#[cfg(not(feature = "extended-header"))]
static_assertions::const_assert_eq!(TAG_SIZE, 8);
#[cfg(feature = "extended-header")]
static_assertions::const_assert_eq!(TAG_SIZE, 12);

const ALLOCATED_BIT: u32 = 1 << 31;
/// Payload sizes are 31-bit.
pub(crate) const SIZE_MASK: u32 = ALLOCATED_BIT - 1;

/// Decoded tag contents.
///
/// `owner` is carried here in both layouts so the allocator logic stays
/// layout-agnostic; in the compact layout it is simply not persisted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Tag {
    pub allocated: bool,
    pub size: u32,
    pub owner: u32,
    pub align_pad: u16,
}

impl Tag {
    /// Packs the fields and seals them with the CRC.
    pub fn seal(&self) -> RawTag {
        let mut raw = RawTag {
            size_word: U32Le::new(
                (self.size & SIZE_MASK)
                    | if self.allocated { ALLOCATED_BIT } else { 0 },
            ),
            #[cfg(feature = "extended-header")]
            owner: U32Le::new(self.owner),
            align_pad: U16Le::new(self.align_pad),
            crc: U16Le::new(0),
        };
        raw.crc = U16Le::new(raw.compute_crc());
        raw
    }
}

impl RawTag {
    /// CRC-16 over every tag byte that precedes the `crc` field.
    fn compute_crc(&self) -> u16 {
        crc16(&CRC16_CCITT_FALSE, &self.as_bytes()[..TAG_SIZE - 2])
    }

    /// Whether the stored CRC matches the stored fields.
    pub fn verify(&self) -> bool {
        self.crc.get() == self.compute_crc()
    }

    /// Decodes the fields without judging their integrity; pair with
    /// [`RawTag::verify`].
    pub fn decode(&self) -> Tag {
        let word = self.size_word.get();
        Tag {
            allocated: word & ALLOCATED_BIT != 0,
            size: word & SIZE_MASK,
            #[cfg(feature = "extended-header")]
            owner: self.owner.get(),
            #[cfg(not(feature = "extended-header"))]
            owner: 0,
            align_pad: self.align_pad.get(),
        }
    }
}
