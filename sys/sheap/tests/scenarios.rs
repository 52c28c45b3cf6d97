// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end allocator scenarios over a 1 KiB arena.
//!
//! These tests drive the public API only, the way an embedder would, and
//! use pointer arithmetic on returned payloads to simulate the caller bugs
//! the heap exists to catch.

use sheap::{
    AllocError, FreeError, HeapStats, SecureHeap, TAG_BYTES,
};
use tripwire::Violation;

const ARENA: usize = 1024;

fn with_heap(body: impl FnOnce(&mut SecureHeap<'_>, usize)) {
    let mut mem = vec![0u8; ARENA];
    let base = mem.as_ptr() as usize;
    let mut heap: SecureHeap<'_> = SecureHeap::new(&mut mem).unwrap();
    body(&mut heap, base);
}

#[test]
fn fresh_heap_is_one_free_block() {
    with_heap(|heap, _| {
        assert_eq!(heap.heap_size(), ARENA);
        assert_eq!(heap.allocated_bytes(), 0);
        let rep = heap.audit().unwrap();
        assert_eq!(rep.blocks, 1);
        assert_eq!(rep.largest_free as usize, ARENA - 2 * TAG_BYTES);
    });
}

#[test]
fn sub_word_request_pads_and_splits() {
    with_heap(|heap, base| {
        let p = heap.allocate(5, 1).unwrap();
        // Payload begins right after the first header.
        assert_eq!(p.as_ptr() as usize, base + TAG_BYTES);
        assert_eq!(heap.allocated_bytes(), 5);
        assert_eq!(heap.allocated_bytes_aligned(), 8);

        // The remainder block follows the 8-byte payload and boundary; its
        // payload is everything left after its own two tags.
        let rep = heap.audit().unwrap();
        assert_eq!(rep.blocks, 2);
        assert_eq!(
            rep.largest_free as usize,
            ARENA - (3 * TAG_BYTES + 8) - TAG_BYTES
        );
    });
}

#[test]
fn one_byte_overrun_is_caught_in_the_padding() {
    with_heap(|heap, _| {
        let p = heap.allocate(5, 1).unwrap();
        let before = heap.stats();
        let oob = tripwire::count(Violation::OutOfBoundWrite);

        // Classic off-by-one: writing element [5] of a 5-byte buffer. The
        // write lands in the alignment padding, not the boundary tag.
        unsafe { p.as_ptr().add(5).write(0x00) };

        assert_eq!(heap.free(p.as_ptr(), 2), Err(FreeError::OutOfBoundWrite));
        assert_eq!(tripwire::count(Violation::OutOfBoundWrite), oob + 1);
        // Nothing changed: the block is still allocated.
        assert_eq!(heap.stats(), before);
        assert_eq!(heap.audit().unwrap().live_allocations, 1);

        // Restoring the padding byte makes the block releasable again.
        unsafe { p.as_ptr().add(5).write(0xFF) };
        heap.free(p.as_ptr(), 3).unwrap();
    });
}

#[test]
fn freeing_both_blocks_restores_a_single_span() {
    with_heap(|heap, _| {
        let a = heap.allocate(100, 1).unwrap();
        let b = heap.allocate(200, 2).unwrap();
        heap.free(a.as_ptr(), 3).unwrap();
        // Freeing b merges backward into a's hole and forward into the
        // trailing free block.
        heap.free(b.as_ptr(), 4).unwrap();

        let rep = heap.audit().unwrap();
        assert_eq!(rep.blocks, 1);
        assert_eq!(rep.largest_free as usize, ARENA - 2 * TAG_BYTES);
    });
}

#[test]
fn first_fit_hands_back_the_same_block_after_reclaim() {
    with_heap(|heap, _| {
        let p1 = heap.allocate(64, 1).unwrap();
        heap.free(p1.as_ptr(), 1).unwrap();
        let p2 = heap.allocate(64, 1).unwrap();
        assert_eq!(p1, p2);
        heap.free(p2.as_ptr(), 1).unwrap();
    });
}

#[test]
fn double_free_is_refused() {
    with_heap(|heap, _| {
        let p = heap.allocate(40, 1).unwrap();
        heap.free(p.as_ptr(), 1).unwrap();
        let dbl = tripwire::count(Violation::DoubleFree);
        assert_eq!(heap.free(p.as_ptr(), 1), Err(FreeError::DoubleFree));
        assert_eq!(tripwire::count(Violation::DoubleFree), dbl + 1);
    });
}

#[test]
fn zero_size_allocation_is_refused() {
    with_heap(|heap, _| {
        assert_eq!(heap.allocate(0, 9), Err(AllocError::SizeZero));
        assert_eq!(heap.stats(), HeapStats::default());
    });
}

#[test]
fn whole_arena_request_is_out_of_memory() {
    with_heap(|heap, _| {
        // The tags have to live somewhere.
        assert_eq!(heap.allocate(ARENA, 1), Err(AllocError::OutOfMemory));
    });
}

#[test]
fn largest_possible_request_succeeds_on_a_fresh_heap() {
    with_heap(|heap, _| {
        let p = heap.allocate(ARENA - 2 * TAG_BYTES, 1).unwrap();
        assert_eq!(heap.allocated_bytes() as usize, ARENA - 2 * TAG_BYTES);
        heap.free(p.as_ptr(), 2).unwrap();
        assert_eq!(heap.allocated_bytes(), 0);
    });
}

#[test]
fn heap_fills_up_then_recovers() {
    with_heap(|heap, _| {
        let mut held = Vec::new();
        loop {
            match heap.allocate(128, 1) {
                Ok(p) => held.push(p),
                Err(AllocError::OutOfMemory) => break,
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        assert!(!held.is_empty());
        for p in held {
            heap.free(p.as_ptr(), 2).unwrap();
        }
        assert_eq!(heap.audit().unwrap().blocks, 1);
    });
}

#[test]
fn damaged_header_is_refused_without_crashing() {
    with_heap(|heap, _| {
        let p = heap.allocate(32, 1).unwrap();
        // Stomp a header byte the way a buggy neighbour would.
        unsafe {
            let crc_byte = p.as_ptr().sub(2);
            crc_byte.write(!crc_byte.read());
        }
        assert_eq!(heap.free(p.as_ptr(), 2), Err(FreeError::BadHeader));
        // The damage is persistent: allocation walks refuse too, since the
        // first block's tag no longer verifies.
        assert_eq!(heap.allocate(8, 3), Err(AllocError::InvalidBlock));
    });
}

#[test]
fn damaged_boundary_is_distinguished_from_damaged_header() {
    with_heap(|heap, _| {
        // Exactly-aligned request: no padding, so the first byte past the
        // payload is the boundary tag itself.
        let p = heap.allocate(32, 1).unwrap();
        let bad = tripwire::count(Violation::FreeInvalidBoundary);
        unsafe { p.as_ptr().add(32).write(0x00) };
        assert_eq!(heap.free(p.as_ptr(), 2), Err(FreeError::BadBoundary));
        assert_eq!(
            tripwire::count(Violation::FreeInvalidBoundary),
            bad + 1
        );
    });
}

#[test]
fn corrupt_neighbour_blocks_coalescing_but_not_the_free() {
    with_heap(|heap, _| {
        let p = heap.allocate(32, 1).unwrap();
        // Flip a low size bit in the trailing free block's header: it
        // still reads as "free", but its CRC no longer matches.
        let next_header = unsafe { p.as_ptr().add(32 + TAG_BYTES) };
        let stale = unsafe { next_header.read() };
        unsafe { next_header.write(stale ^ 0x01) };

        let skipped = tripwire::count(Violation::CoalesceNextInvalidCrc);
        assert_eq!(heap.free(p.as_ptr(), 2), Ok(()));
        assert_eq!(
            tripwire::count(Violation::CoalesceNextInvalidCrc),
            skipped + 1
        );
    });
}

#[test]
fn latest_ids_read_newest_first() {
    with_heap(|heap, _| {
        let p1 = heap.allocate(8, 0x11).unwrap();
        let p2 = heap.allocate(8, 0x22).unwrap();
        heap.free(p1.as_ptr(), 0x33).unwrap();
        heap.free(p2.as_ptr(), 0x44).unwrap();

        let mut ids = [0u32; 8];
        let n = heap.latest_ids(&mut ids);
        assert_eq!(n, 4);
        assert_eq!(&ids[..4], &[0x44, 0x33, 0x22, 0x11]);
    });
}

#[test]
fn failed_calls_still_record_their_ids() {
    with_heap(|heap, _| {
        let _ = heap.allocate(0, 0x77);
        let mut ids = [0u32; 2];
        assert_eq!(heap.latest_ids(&mut ids), 1);
        assert_eq!(ids[0], 0x77);
    });
}

#[cfg(feature = "extended-header")]
#[test]
fn allocation_id_tracks_the_last_mutating_call() {
    with_heap(|heap, _| {
        let p = heap.allocate(24, 0xAA).unwrap();
        assert_eq!(heap.allocation_id(p.as_ptr()), Ok(0xAA));
    });
}
