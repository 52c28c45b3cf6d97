// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary-tagged allocator itself.
//!
//! [`SecureHeap`] owns a borrowed byte arena and tiles it, end to end and
//! with no gaps, with blocks of the form `TAG | payload | TAG`. Allocation
//! is a first-fit walk from the arena start; free re-seals the block and
//! eagerly merges it with free neighbours on both sides, so two adjacent
//! free blocks never survive an operation.
//!
//! Exclusion is by ownership: every mutating operation takes `&mut self`,
//! so a `SecureHeap` handle cannot be re-entered. Deployments that need to
//! share one heap between contexts wrap it in [`crate::SharedHeap`].
//!
//! Nothing here panics on corrupt arena contents. Every walked tag is
//! CRC-verified before its fields are believed, every failure is returned
//! as a typed error and raised through [`tripwire`], and a failed operation
//! leaves the arena untouched. A block that fails verification stays where
//! it is -- there is no repair and no reclamation, and every subsequent
//! operation that encounters it will keep refusing.

use core::marker::PhantomData;
use core::ptr::NonNull;

use tripwire::{raise, Violation};

use crate::block::{RawTag, Tag, SIZE_MASK, TAG_SIZE};
use crate::idring::IdRing;

/// Allocation unit and hard floor for `min_alloc`.
pub const ALIGN_UNIT: u32 = 4;

/// Owner id stamped on blocks the allocator creates for itself (the
/// remainder of a split). Never recorded in the id ring.
pub const AUTO_BLOCK_ID: u32 = 0;

/// Placement strategy for the free-block search.
///
/// Only first-fit is implemented; the other variants exist so that a
/// configuration asking for them is refused loudly instead of silently
/// behaving like first-fit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AllocStrategy {
    #[default]
    FirstFit,
    BestFit,
    WorstFit,
}

/// Build-time knobs of the C rendition, carried as plain data.
#[derive(Copy, Clone, Debug)]
pub struct HeapConfig {
    /// Allocation unit; clamped to at least [`ALIGN_UNIT`] and rounded up
    /// to a multiple of it.
    pub min_alloc: u32,
    /// Byte written over freed payloads and alignment padding.
    pub fill_byte: u8,
    /// Byte the calloc-style entry point fills requested payload with.
    pub calloc_byte: u8,
    /// Verify alignment padding on free (catches 1..3-byte overruns of a
    /// sub-word request before they reach the boundary tag).
    pub check_padding: bool,
    /// Overwrite payload with `fill_byte` on free.
    pub scrub_on_free: bool,
    pub strategy: AllocStrategy,
}

impl HeapConfig {
    pub const fn new() -> Self {
        Self {
            min_alloc: ALIGN_UNIT,
            fill_byte: 0xFF,
            calloc_byte: 0x00,
            check_padding: true,
            scrub_on_free: true,
            strategy: AllocStrategy::FirstFit,
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals, maintained by addition on allocate and subtraction on
/// free.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Blocks currently allocated.
    pub live_allocations: u32,
    /// Bytes the callers actually asked for.
    pub user_bytes: u32,
    /// Payload bytes including alignment padding.
    pub aligned_bytes: u32,
    /// Payload plus both tags, per live block.
    pub gross_bytes: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    /// Arena empty, not a multiple of four bytes, or too small to hold one
    /// minimal block.
    InvalidSize,
    /// A strategy other than first-fit was requested.
    UnsupportedStrategy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    SizeZero,
    OutOfMemory,
    /// A tag failed verification during the walk; the heap is corrupt and
    /// needs operator attention.
    InvalidBlock,
    /// The heap was re-entered while another call was in progress
    /// (shared-facade builds only).
    Busy,
    /// The heap mutex could not be acquired in time (shared-facade builds
    /// only).
    Lock,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FreeError {
    Null,
    NotInHeap,
    BadHeader,
    /// Header verified but the boundary tag does not match it -- the usual
    /// signature of an out-of-bound write from the block before the next
    /// header.
    BadBoundary,
    /// The alignment padding was modified: the caller wrote past its
    /// requested size.
    OutOfBoundWrite,
    DoubleFree,
    Busy,
    Lock,
}

/// Failures from the read-only block queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryError {
    NotInHeap,
    BadHeader,
    BadBoundary,
    NotAllocated,
}

/// Arena-wide invariant check results; see [`SecureHeap::audit`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub blocks: usize,
    pub free_blocks: usize,
    pub live_allocations: u32,
    pub user_bytes: u32,
    pub aligned_bytes: u32,
    /// Largest free payload, i.e. the biggest request that would currently
    /// succeed without splitting.
    pub largest_free: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuditError {
    /// Tag at `offset` failed its CRC.
    BadTag { offset: usize },
    /// Header and boundary of the block at `offset` disagree.
    MismatchedBoundary { offset: usize },
    /// Block geometry at `offset` is impossible (runs past the arena end,
    /// or a size that is zero or unaligned).
    BadGeometry { offset: usize },
    /// Two free blocks touch; coalescing was missed.
    AdjacentFree { offset: usize },
    /// The walked totals disagree with the running statistics.
    StatsDrift,
}

/// The allocator. `LOG` is the capacity of the caller-id ring.
pub struct SecureHeap<'a, const LOG: usize = 16> {
    base: NonNull<u8>,
    len: usize,
    cfg: HeapConfig,
    stats: HeapStats,
    ring: IdRing<LOG>,
    _arena: PhantomData<&'a mut [u8]>,
}

// Safety: SecureHeap exclusively owns the borrowed arena for its lifetime;
// the raw base pointer is just the borrow with the slice metadata peeled
// off.
unsafe impl<const LOG: usize> Send for SecureHeap<'_, LOG> {}

impl<'a, const LOG: usize> SecureHeap<'a, LOG> {
    /// Takes over `arena` with the default configuration.
    pub fn new(arena: &'a mut [u8]) -> Result<Self, InitError> {
        Self::with_config(arena, HeapConfig::new())
    }

    /// Takes over `arena`: fills it with the fill byte and lays down one
    /// free block spanning the whole of it.
    ///
    /// The arena length must be a multiple of four and large enough for one
    /// minimal block (`2 * tag + min_alloc`); anything else is refused as
    /// [`InitError::InvalidSize`]. A trailing sub-word remainder would
    /// otherwise break the exact-tiling invariant the integrity checks
    /// depend on.
    pub fn with_config(
        arena: &'a mut [u8],
        cfg: HeapConfig,
    ) -> Result<Self, InitError> {
        if cfg.strategy != AllocStrategy::FirstFit {
            raise(Violation::StrategyUnsupported);
            return Err(InitError::UnsupportedStrategy);
        }
        let mut cfg = cfg;
        let clamped = cfg.min_alloc.max(ALIGN_UNIT);
        cfg.min_alloc = clamped.div_ceil(ALIGN_UNIT) * ALIGN_UNIT;

        let len = arena.len();
        let usable = len.saturating_sub(2 * TAG_SIZE);
        if len % ALIGN_UNIT as usize != 0
            || usable < cfg.min_alloc as usize
            || usable > SIZE_MASK as usize
        {
            raise(Violation::InitInvalidSize);
            return Err(InitError::InvalidSize);
        }

        // Safety: a slice data pointer is never null.
        let base = unsafe { NonNull::new_unchecked(arena.as_mut_ptr()) };
        let mut heap = Self {
            base,
            len,
            cfg,
            stats: HeapStats::default(),
            ring: IdRing::new(),
            _arena: PhantomData,
        };
        heap.fill(0, len, heap.cfg.fill_byte);
        heap.put_pair(
            0,
            Tag {
                allocated: false,
                size: usable as u32,
                owner: AUTO_BLOCK_ID,
                align_pad: 0,
            },
        );
        Ok(heap)
    }

    /// Rounds `n` up to the allocation unit. Saturates near `usize::MAX`.
    pub fn align_up(&self, n: usize) -> usize {
        let unit = self.cfg.min_alloc as usize;
        match n.checked_add(unit - 1) {
            Some(x) => x / unit * unit,
            None => usize::MAX / unit * unit,
        }
    }

    /// Total arena length in bytes.
    pub fn heap_size(&self) -> usize {
        self.len
    }

    /// Bytes callers have asked for and not yet freed.
    pub fn allocated_bytes(&self) -> u32 {
        self.stats.user_bytes
    }

    /// Like [`Self::allocated_bytes`], but counting alignment padding.
    pub fn allocated_bytes_aligned(&self) -> u32 {
        self.stats.aligned_bytes
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Copies the most recent caller ids, newest first; see
    /// [`IdRing::latest`] semantics. Returns the count written.
    pub fn latest_ids(&self, dest: &mut [u32]) -> usize {
        self.ring.latest(dest)
    }

    /// Allocates `size` bytes. The payload is *not* initialised; use
    /// [`Self::allocate_filled`] for the calloc-style form.
    ///
    /// `id` is an opaque caller identifier (a return address, a task id, a
    /// debug counter -- whatever the call site can supply) recorded in the
    /// id ring and, in the extended tag layout, in the block itself.
    pub fn allocate(
        &mut self,
        size: usize,
        id: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        self.ring.record(id);
        if size == 0 {
            raise(Violation::ZeroSizeAlloc);
            return Err(AllocError::SizeZero);
        }
        let aligned = self.align_up(size);
        if aligned > SIZE_MASK as usize || aligned < size {
            raise(Violation::OutOfMemory);
            return Err(AllocError::OutOfMemory);
        }
        let (off, available) = self.find_first_fit(aligned)?;
        Ok(self.place(off, available, aligned, size, id))
    }

    /// The calloc form: `count` elements of `size` bytes, with every
    /// requested byte set to the configured calloc byte. Alignment padding
    /// is sealed with the fill byte, as for any allocation, so the
    /// padding check stays meaningful.
    pub fn allocate_filled(
        &mut self,
        count: usize,
        size: usize,
        id: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = match count.checked_mul(size) {
            Some(t) => t,
            None => {
                raise(Violation::OutOfMemory);
                return Err(AllocError::OutOfMemory);
            }
        };
        let ptr = self.allocate(total, id)?;
        let off = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        self.fill(off, total, self.cfg.calloc_byte);
        Ok(ptr)
    }

    /// Releases the block whose payload starts at `ptr`.
    ///
    /// The pointer is validated from scratch -- range, header CRC, boundary
    /// agreement, padding bytes, allocation state -- before anything is
    /// modified, and any failure leaves the heap exactly as it was.
    pub fn free(&mut self, ptr: *mut u8, id: u32) -> Result<(), FreeError> {
        self.ring.record(id);
        if ptr.is_null() {
            raise(Violation::NullFree);
            return Err(FreeError::Null);
        }
        let off = match self.payload_offset(ptr as usize) {
            Some(off) => off,
            None => {
                raise(Violation::FreePtrNotInHeap);
                return Err(FreeError::NotInHeap);
            }
        };
        let raw = self.raw_tag(off);
        if !raw.verify() {
            raise(Violation::FreeInvalidHeader);
            return Err(FreeError::BadHeader);
        }
        let tag = raw.decode();
        let size = tag.size as usize;
        let end = off + 2 * TAG_SIZE + size;
        if end > self.len {
            // CRC-valid but geometrically impossible: stale tag bytes
            // replayed into the arena.
            raise(Violation::FreeInvalidHeader);
            return Err(FreeError::BadHeader);
        }
        if self.raw_tag(off + TAG_SIZE + size) != raw {
            raise(Violation::FreeInvalidBoundary);
            return Err(FreeError::BadBoundary);
        }
        if self.cfg.check_padding && tag.allocated && tag.align_pad != 0 {
            let pad = tag.align_pad as usize;
            if !self.all_bytes(end - TAG_SIZE - pad, pad, self.cfg.fill_byte) {
                raise(Violation::OutOfBoundWrite);
                return Err(FreeError::OutOfBoundWrite);
            }
        }
        if !tag.allocated {
            raise(Violation::DoubleFree);
            return Err(FreeError::DoubleFree);
        }

        self.stats.live_allocations -= 1;
        self.stats.user_bytes -= tag.size - u32::from(tag.align_pad);
        self.stats.aligned_bytes -= tag.size;
        self.stats.gross_bytes -= tag.size + 2 * TAG_SIZE as u32;

        let (new_off, new_size) = self.coalesce(off, size);
        if self.cfg.scrub_on_free {
            self.fill(new_off + TAG_SIZE, new_size, self.cfg.fill_byte);
        }
        self.put_pair(
            new_off,
            Tag {
                allocated: false,
                size: new_size as u32,
                owner: id,
                align_pad: 0,
            },
        );
        Ok(())
    }

    /// Reports the owner id recorded at the last mutating call on the
    /// allocated, integrity-valid block at `ptr`. Read-only; failures are
    /// returned but not raised.
    #[cfg(feature = "extended-header")]
    pub fn allocation_id(&self, ptr: *const u8) -> Result<u32, QueryError> {
        let off = self
            .payload_offset(ptr as usize)
            .ok_or(QueryError::NotInHeap)?;
        let raw = self.raw_tag(off);
        if !raw.verify() {
            return Err(QueryError::BadHeader);
        }
        let tag = raw.decode();
        let size = tag.size as usize;
        if off + 2 * TAG_SIZE + size > self.len {
            return Err(QueryError::BadHeader);
        }
        if self.raw_tag(off + TAG_SIZE + size) != raw {
            return Err(QueryError::BadBoundary);
        }
        if !tag.allocated {
            return Err(QueryError::NotAllocated);
        }
        Ok(tag.owner)
    }

    /// Walks the whole arena and checks every structural invariant: tag
    /// CRCs, header/boundary agreement, exact tiling, block geometry,
    /// coalescing maximality, and agreement with the running statistics.
    pub fn audit(&self) -> Result<AuditReport, AuditError> {
        let mut rep = AuditReport::default();
        let mut off = 0;
        let mut prev_free = false;
        while off + 2 * TAG_SIZE <= self.len {
            let raw = self.raw_tag(off);
            if !raw.verify() {
                return Err(AuditError::BadTag { offset: off });
            }
            let tag = raw.decode();
            let size = tag.size as usize;
            let end = off + 2 * TAG_SIZE + size;
            if end > self.len
                || size % ALIGN_UNIT as usize != 0
                || size < ALIGN_UNIT as usize
            {
                return Err(AuditError::BadGeometry { offset: off });
            }
            if self.raw_tag(off + TAG_SIZE + size) != raw {
                return Err(AuditError::MismatchedBoundary { offset: off });
            }
            rep.blocks += 1;
            if tag.allocated {
                prev_free = false;
                rep.live_allocations += 1;
                rep.user_bytes += tag.size - u32::from(tag.align_pad);
                rep.aligned_bytes += tag.size;
            } else {
                if prev_free {
                    return Err(AuditError::AdjacentFree { offset: off });
                }
                prev_free = true;
                rep.free_blocks += 1;
                rep.largest_free = rep.largest_free.max(tag.size);
            }
            off = end;
        }
        if off != self.len {
            return Err(AuditError::BadGeometry { offset: off });
        }
        if rep.live_allocations != self.stats.live_allocations
            || rep.user_bytes != self.stats.user_bytes
            || rep.aligned_bytes != self.stats.aligned_bytes
        {
            return Err(AuditError::StatsDrift);
        }
        Ok(rep)
    }

    // ---- internals ----

    /// First-fit walk. Returns the offset and payload size of the first
    /// free block that can hold `aligned` bytes.
    fn find_first_fit(
        &mut self,
        aligned: usize,
    ) -> Result<(usize, usize), AllocError> {
        let mut off = 0;
        while off + 2 * TAG_SIZE <= self.len {
            let raw = self.raw_tag(off);
            if !raw.verify() {
                raise(Violation::InvalidBlock);
                return Err(AllocError::InvalidBlock);
            }
            let tag = raw.decode();
            let size = tag.size as usize;
            let end = off + 2 * TAG_SIZE + size;
            if end > self.len {
                raise(Violation::InvalidBlock);
                return Err(AllocError::InvalidBlock);
            }
            if !tag.allocated && size >= aligned {
                return Ok((off, size));
            }
            off = end;
        }
        raise(Violation::OutOfMemory);
        Err(AllocError::OutOfMemory)
    }

    /// Carves `aligned` bytes out of the free block at `off` (payload size
    /// `available`), splitting off the remainder when it is big enough to
    /// stand as a block of its own.
    fn place(
        &mut self,
        off: usize,
        available: usize,
        aligned: usize,
        requested: usize,
        id: u32,
    ) -> NonNull<u8> {
        let min = self.cfg.min_alloc as usize;
        // A remainder smaller than the smallest representable block can't
        // be split off; the allocation absorbs it instead.
        let take = if available - aligned >= 2 * TAG_SIZE + min {
            aligned
        } else {
            available
        };
        let pad = (take - requested) as u16;

        self.put_pair(
            off,
            Tag {
                allocated: true,
                size: take as u32,
                owner: id,
                align_pad: pad,
            },
        );
        if take < available {
            self.put_pair(
                off + 2 * TAG_SIZE + take,
                Tag {
                    allocated: false,
                    size: (available - take - 2 * TAG_SIZE) as u32,
                    owner: AUTO_BLOCK_ID,
                    align_pad: 0,
                },
            );
        }
        if pad != 0 {
            // Seal the padding so the free-time check has a reference
            // value to compare against.
            self.fill(
                off + TAG_SIZE + requested,
                pad as usize,
                self.cfg.fill_byte,
            );
        }

        self.stats.live_allocations += 1;
        self.stats.user_bytes += requested as u32;
        self.stats.aligned_bytes += take as u32;
        self.stats.gross_bytes += take as u32 + 2 * TAG_SIZE as u32;

        // Safety: off + TAG_SIZE is inside the arena, and base is non-null.
        unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(off + TAG_SIZE))
        }
    }

    /// Extends the about-to-be-freed block at `off` over its free
    /// neighbours. Returns the merged block's offset and payload size. A
    /// neighbour that looks free but fails verification is reported and
    /// left alone.
    fn coalesce(&mut self, off: usize, size: usize) -> (usize, usize) {
        let min = self.cfg.min_alloc as usize;
        let mut new_off = off;
        let mut new_size = size;

        let next_off = off + 2 * TAG_SIZE + size;
        if next_off + 2 * TAG_SIZE + min <= self.len {
            let raw = self.raw_tag(next_off);
            let next = raw.decode();
            if !next.allocated {
                let nsize = next.size as usize;
                if raw.verify()
                    && next_off + 2 * TAG_SIZE + nsize <= self.len
                {
                    new_size += 2 * TAG_SIZE + nsize;
                } else {
                    raise(Violation::CoalesceNextInvalidCrc);
                }
            }
        }

        if off >= 2 * TAG_SIZE + min {
            // The previous block's boundary tag sits directly below our
            // header.
            let raw = self.raw_tag(off - TAG_SIZE);
            let prev = raw.decode();
            if !prev.allocated {
                let psize = prev.size as usize;
                if raw.verify() && off >= 2 * TAG_SIZE + psize {
                    new_off = off - 2 * TAG_SIZE - psize;
                    new_size += 2 * TAG_SIZE + psize;
                } else {
                    raise(Violation::CoalescePrevInvalidCrc);
                }
            }
        }

        (new_off, new_size)
    }

    /// Offset of the block header for a payload address, or `None` when
    /// the address cannot be a payload this heap handed out.
    fn payload_offset(&self, addr: usize) -> Option<usize> {
        let base = self.base.as_ptr() as usize;
        if addr < base + TAG_SIZE || addr >= base + self.len - TAG_SIZE {
            return None;
        }
        Some(addr - base - TAG_SIZE)
    }

    fn raw_tag(&self, off: usize) -> RawTag {
        debug_assert!(off + TAG_SIZE <= self.len);
        // Safety: `off` is within the arena (asserted above; all callers
        // derive it from bounds-checked walk arithmetic), and RawTag is
        // FromBytes + Unaligned, so any byte pattern is a valid value.
        unsafe {
            self.base.as_ptr().add(off).cast::<RawTag>().read_unaligned()
        }
    }

    fn put_tag(&mut self, off: usize, raw: RawTag) {
        debug_assert!(off + TAG_SIZE <= self.len);
        // Safety: as in raw_tag, plus we hold &mut self, so nothing else is
        // reading the arena metadata concurrently.
        unsafe {
            self.base
                .as_ptr()
                .add(off)
                .cast::<RawTag>()
                .write_unaligned(raw);
        }
    }

    /// Seals `tag` and writes it as both header and boundary of the block
    /// at `off`. The two are always written together, so an observer with
    /// the heap lock never sees them disagree.
    fn put_pair(&mut self, off: usize, tag: Tag) {
        let raw = tag.seal();
        self.put_tag(off, raw);
        self.put_tag(off + TAG_SIZE + tag.size as usize, raw);
    }

    fn fill(&mut self, off: usize, n: usize, byte: u8) {
        debug_assert!(off + n <= self.len);
        // Safety: range is within the arena and we hold &mut self.
        unsafe {
            core::ptr::write_bytes(self.base.as_ptr().add(off), byte, n);
        }
    }

    fn all_bytes(&self, off: usize, n: usize, byte: u8) -> bool {
        debug_assert!(off + n <= self.len);
        (0..n).all(|i| {
            // Safety: range is within the arena.
            unsafe { self.base.as_ptr().add(off + i).read() == byte }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::TAG_SIZE;

    fn arena() -> Vec<u8> {
        vec![0u8; 1024]
    }

    #[test]
    fn init_lays_down_one_free_block() {
        let mut mem = arena();
        let heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
        let rep = heap.audit().unwrap();
        assert_eq!(rep.blocks, 1);
        assert_eq!(rep.free_blocks, 1);
        assert_eq!(rep.largest_free as usize, 1024 - 2 * TAG_SIZE);
    }

    #[test]
    fn init_rejects_tiny_and_unaligned_arenas() {
        let mut small = [0u8; 8];
        assert_eq!(
            SecureHeap::<'_, 16>::new(&mut small).err(),
            Some(InitError::InvalidSize)
        );
        let mut crooked = [0u8; 1023];
        assert_eq!(
            SecureHeap::<'_, 16>::new(&mut crooked).err(),
            Some(InitError::InvalidSize)
        );
        let mut empty: [u8; 0] = [];
        assert_eq!(
            SecureHeap::<'_, 16>::new(&mut empty).err(),
            Some(InitError::InvalidSize)
        );
    }

    #[test]
    fn init_rejects_reserved_strategies() {
        let mut mem = arena();
        let cfg = HeapConfig {
            strategy: AllocStrategy::BestFit,
            ..HeapConfig::new()
        };
        assert_eq!(
            SecureHeap::<'_, 16>::with_config(&mut mem, cfg).err(),
            Some(InitError::UnsupportedStrategy)
        );
    }

    #[test]
    fn min_alloc_is_clamped_and_rounded() {
        let mut mem = arena();
        let cfg = HeapConfig {
            min_alloc: 6,
            ..HeapConfig::new()
        };
        let mut heap = SecureHeap::<'_, 16>::with_config(&mut mem, cfg).unwrap();
        // 6 rounds up to 8; a 1-byte request comes back 8-aligned.
        assert_eq!(heap.align_up(1), 8);
        let p = heap.allocate(1, 1).unwrap();
        heap.free(p.as_ptr(), 1).unwrap();
        heap.audit().unwrap();
    }

    #[test]
    fn split_leaves_a_well_formed_remainder() {
        let mut mem = arena();
        let mut heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
        heap.allocate(100, 1).unwrap();
        let rep = heap.audit().unwrap();
        assert_eq!(rep.blocks, 2);
        assert_eq!(rep.live_allocations, 1);
        assert_eq!(rep.free_blocks, 1);
    }

    #[test]
    fn too_small_remainder_is_absorbed() {
        let mut mem = arena();
        let mut heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
        let whole = 1024 - 2 * TAG_SIZE;
        // Ask for just under the whole arena: the leftover can't hold a
        // minimal block, so the allocation swallows it.
        let p = heap.allocate(whole - 8, 1).unwrap();
        let rep = heap.audit().unwrap();
        assert_eq!(rep.blocks, 1);
        assert_eq!(heap.allocated_bytes_aligned() as usize, whole);
        assert_eq!(heap.allocated_bytes() as usize, whole - 8);
        heap.free(p.as_ptr(), 1).unwrap();
        assert_eq!(heap.audit().unwrap().free_blocks, 1);
    }

    #[test]
    fn allocate_filled_sets_requested_bytes_only() {
        let mut mem = arena();
        let cfg = HeapConfig {
            calloc_byte: 0xAB,
            ..HeapConfig::new()
        };
        let mut heap = SecureHeap::<'_, 16>::with_config(&mut mem, cfg).unwrap();
        let p = heap.allocate_filled(3, 2, 7).unwrap();
        let payload = p.as_ptr();
        for i in 0..6 {
            // Safety: 6 bytes were just allocated at `payload`.
            assert_eq!(unsafe { payload.add(i).read() }, 0xAB);
        }
        // The two padding bytes carry the fill pattern, not the calloc
        // byte.
        for i in 6..8 {
            assert_eq!(unsafe { payload.add(i).read() }, 0xFF);
        }
    }

    #[test]
    fn allocate_filled_rejects_overflowing_products() {
        let mut mem = arena();
        let mut heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
        assert_eq!(
            heap.allocate_filled(usize::MAX, 2, 1).err(),
            Some(AllocError::OutOfMemory)
        );
    }

    #[test]
    fn free_rejects_foreign_and_null_pointers() {
        let mut mem = arena();
        let mut heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
        assert_eq!(
            heap.free(core::ptr::null_mut(), 1).err(),
            Some(FreeError::Null)
        );
        let mut local = 0u8;
        assert_eq!(
            heap.free(&mut local as *mut u8, 1).err(),
            Some(FreeError::NotInHeap)
        );
    }

    #[test]
    fn stats_return_to_zero_after_full_free() {
        let mut mem = arena();
        let mut heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
        let a = heap.allocate(17, 1).unwrap();
        let b = heap.allocate(32, 2).unwrap();
        heap.free(a.as_ptr(), 3).unwrap();
        heap.free(b.as_ptr(), 4).unwrap();
        assert_eq!(heap.stats(), HeapStats::default());
        assert_eq!(heap.audit().unwrap().blocks, 1);
    }

    #[cfg(feature = "extended-header")]
    #[test]
    fn allocation_id_reports_the_recorded_owner() {
        let mut mem = arena();
        let mut heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
        let p = heap.allocate(12, 0xBEEF).unwrap();
        assert_eq!(heap.allocation_id(p.as_ptr()), Ok(0xBEEF));
        heap.free(p.as_ptr(), 1).unwrap();
        assert_eq!(
            heap.allocation_id(p.as_ptr()),
            Err(QueryError::NotAllocated)
        );
    }
}
