//! Shared test support.
extern crate std;

use std::{collections::BTreeMap, ops::Range, ptr::NonNull};

use crate::heap::{DWORD, MIN_BLOCK_SIZE, WORD};

/// The smallest block that can hold a `len`-byte payload: the payload plus a
/// word of header and a word of footer, rounded to `DWORD` granules, never
/// below the minimum block size.
fn block_span(len: usize) -> usize {
    ((len + DWORD).max(MIN_BLOCK_SIZE) + DWORD - 1) & !(DWORD - 1)
}

/// A model of the allocator's observable behavior, maintained alongside the
/// real heap by the random tests.
///
/// It records the heap region exactly as the source reports serving it, and
/// every live payload with its requested length. Everything the allocator
/// does is then checked against what the block layout permits:
///
///  - extensions are contiguous, so the region is a single growing range;
///  - payloads are `DWORD`-aligned and lie between the prologue and the
///    epilogue clearance at the top;
///  - two live payloads are separated by at least the smaller one's whole
///    block, since a block's tags and slack sit between its payload and the
///    next;
///  - only a live payload can be deallocated, exactly once, at its recorded
///    length.
#[derive(Debug, Default)]
pub struct ShadowAllocator {
    heap: Option<Range<usize>>,
    live: BTreeMap<usize, usize>,
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heap extension of `len` bytes starting at `start`.
    pub fn extend_heap(&mut self, start: NonNull<u8>, len: usize) {
        let start = start.as_ptr() as usize;
        log::trace!("sa: heap extended by {} bytes at {:#x}", len, start);

        match &mut self.heap {
            None => {
                assert_eq!(start % DWORD, 0, "heap base {:#x} is misaligned", start);
                self.heap = Some(start..start + len);
            }
            Some(heap) => {
                assert_eq!(
                    start, heap.end,
                    "extension at {:#x} is not contiguous with the heap end {:#x}",
                    start, heap.end
                );
                heap.end += len;
            }
        }
    }

    /// Record a served allocation of `len` bytes at `start`.
    pub fn allocate(&mut self, len: usize, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        log::trace!("sa: {} bytes allocated at {:#x}", len, start);

        assert_eq!(start % DWORD, 0, "payload {:#x} is misaligned", start);
        let heap = self.heap.as_ref().expect("allocation before any extension");
        assert!(
            start >= heap.start + 6 * WORD,
            "payload {:#x} overlaps the heap preamble",
            start
        );
        assert!(
            start + len + DWORD <= heap.end,
            "payload {:#x}..{:#x} runs into the heap top {:#x}",
            start,
            start + len,
            heap.end
        );

        // The neighboring live payloads must each be a whole block away:
        // at minimum the earlier one's tags and slack sit in between.
        if let Some((&below, &below_len)) = self.live.range(..start).next_back() {
            assert!(
                below + block_span(below_len) <= start,
                "payload {:#x} intrudes on the block of {:#x} (len {})",
                start,
                below,
                below_len
            );
        }
        if let Some((&above, _)) = self.live.range(start..).next() {
            assert!(
                start + block_span(len) <= above,
                "payload {:#x} (len {}) reaches into the block of {:#x}",
                start,
                len,
                above
            );
        }

        self.live.insert(start, len);
    }

    /// Record a deallocation of the payload at `start`.
    pub fn deallocate(&mut self, len: usize, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        log::trace!("sa: {} bytes deallocated at {:#x}", len, start);

        match self.live.remove(&start) {
            Some(recorded) => assert_eq!(
                recorded, len,
                "payload {:#x} deallocated with length {} but served with {}",
                start, len, recorded
            ),
            None => panic!("deallocating {:#x}, which is not a live payload", start),
        }
    }
}
