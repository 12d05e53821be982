//! The explicit-free-list allocator core.
use core::{
    mem,
    ptr::{self, NonNull},
};

use crate::source::HeapSource;

/// The size in bytes of a boundary-tag word.
pub const WORD: usize = mem::size_of::<usize>();

/// The allocation granularity. Block sizes are multiples of `DWORD` and
/// every payload address is aligned to it.
pub const DWORD: usize = WORD * 2;

/// The minimum size of a block: header, two free-list link words, footer.
pub const MIN_BLOCK_SIZE: usize = 4 * WORD;

/// The default amount by which the heap grows when the free list has no fit.
pub const CHUNK_SIZE: usize = 4096;

/// The bit of a boundary tag indicating that the block is allocated.
const SIZE_USED: usize = 1;
/// The bits of a boundary tag representing the block's size.
const SIZE_MASK: usize = !(DWORD - 1);

/// Reports a consistency violation and counts it.
macro_rules! violation {
    ($count:ident, $($arg:tt)*) => {{
        $count += 1;
        log::error!($($arg)*);
    }};
}

/// A block handle, addressed by its payload pointer.
///
/// The header word sits immediately below the payload and the footer word
/// occupies the last `WORD` bytes of the block, so the payload area proper
/// is `size - DWORD` bytes. While a block is free, its first two payload
/// words hold the free-list links, `prev` then `next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    /// # Safety
    ///
    /// `ptr` must be a payload address of a block inside the heap.
    #[inline]
    unsafe fn from_payload(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline]
    fn payload(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    unsafe fn header(self) -> *mut usize {
        self.0.as_ptr().sub(WORD).cast()
    }

    #[inline]
    unsafe fn size(self) -> usize {
        *self.header() & SIZE_MASK
    }

    #[inline]
    unsafe fn is_used(self) -> bool {
        *self.header() & SIZE_USED != 0
    }

    #[inline]
    unsafe fn footer(self) -> *mut usize {
        self.0.as_ptr().add(self.size() - DWORD).cast()
    }

    /// Write matching boundary tags. The header goes first: the footer's
    /// position is derived from the size the header holds.
    #[inline]
    unsafe fn set_tags(self, size: usize, used: bool) {
        *self.header() = size | used as usize;
        *self.footer() = size | used as usize;
    }

    /// The footer word of the physically preceding block.
    #[inline]
    unsafe fn prev_footer(self) -> *mut usize {
        self.0.as_ptr().sub(DWORD).cast()
    }

    #[inline]
    unsafe fn next_block(self) -> BlockPtr {
        BlockPtr(NonNull::new_unchecked(self.0.as_ptr().add(self.size())))
    }

    #[inline]
    unsafe fn prev_block(self) -> BlockPtr {
        let prev_size = *self.prev_footer() & SIZE_MASK;
        BlockPtr(NonNull::new_unchecked(self.0.as_ptr().sub(prev_size)))
    }

    // Free-list links. Only meaningful while the block is free, or for the
    // prologue sentinel, whose payload exists solely to hold these slots.

    #[inline]
    unsafe fn prev_free(self) -> *mut u8 {
        *(self.0.as_ptr() as *mut *mut u8)
    }

    #[inline]
    unsafe fn next_free(self) -> *mut u8 {
        *(self.0.as_ptr().add(WORD) as *mut *mut u8)
    }

    #[inline]
    unsafe fn set_prev_free(self, p: *mut u8) {
        *(self.0.as_ptr() as *mut *mut u8) = p;
    }

    #[inline]
    unsafe fn set_next_free(self, p: *mut u8) {
        *(self.0.as_ptr().add(WORD) as *mut *mut u8) = p;
    }
}

/// Round a request up to a valid block size: the payload plus one word of
/// header and one of footer, in `DWORD` granules, never below the minimum.
#[inline]
fn adjusted_size(size: usize) -> Option<usize> {
    if size == 0 {
        None
    } else if size <= DWORD {
        Some(2 * DWORD)
    } else {
        Some(size.checked_add(2 * DWORD - 1)? & SIZE_MASK)
    }
}

/// A payload address that could plausibly belong to a block: far enough from
/// both heap ends for its boundary tags and link words to be in bounds.
#[inline]
fn plausible_payload(addr: usize, lo: usize, hi: usize) -> bool {
    addr >= lo + DWORD && addr.checked_add(DWORD).map_or(false, |end| end <= hi)
}

/// The error returned by [`Heap::new`] when the source cannot supply the
/// initial heap area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// An explicit-free-list heap allocator over a growable memory region.
///
/// # Data Structure Overview
///
/// ```text
///  lo()                                                          hi()
///   |     |<- prologue ->|<- used and free blocks ...     ->|     |
///   +-----+--+----+----+-+--+------------+--+--+---------+--+-----+
///   | pad |h | pv | nx |f|h |  payload   |f |h | payload |f |h(0) |
///   +-----+--+----+----+-+--+------------+--+--+---------+--+-----+
///             ^                                              ^
///             base: the free list's terminal sentinel        epilogue
///
///   free block:  | header | prev | next |  stale bytes  | footer |
///   used block:  | header |          payload            | footer |
/// ```
///
/// Every block carries its size and allocation bit in both a header and a
/// footer word, so the physical neighbors of any block can be reached in
/// constant time in either direction. Free blocks additionally form a
/// doubly-linked list threaded through their first two payload words, with
/// new entries pushed at the head (LIFO) and the allocated prologue block
/// serving as the terminal node. The prologue's permanently set used bit is
/// what ends the first-fit walk, and its real link slots are what make
/// unlinking the last list entry branch-free on the successor side.
///
/// A zero-size allocated header (the epilogue) caps the heap top, so
/// coalescing needs no bounds checks in either direction.
///
/// # Properties
///
/// Payloads are aligned to [`DWORD`] bytes. Allocation is `O(free blocks)`,
/// deallocation and coalescing are `O(1)`.
#[derive(Debug)]
pub struct Heap<S> {
    source: S,
    /// Payload of the prologue sentinel.
    base: BlockPtr,
    /// Head of the free list; equal to `base` when the list is empty.
    free_head: BlockPtr,
}

// Safety: All blocks reachable from a `Heap` live in the region its source
//         serves, are logically owned by that `Heap`, and have no interior
//         mutability.
unsafe impl<S: Send> Send for Heap<S> {}
unsafe impl<S: Sync> Sync for Heap<S> {}

impl<S: HeapSource> Heap<S> {
    /// Build a heap on `source`.
    ///
    /// Lays down the prologue and epilogue sentinels and grows the heap by
    /// one [`CHUNK_SIZE`] so the first allocations need no extension. Fails
    /// if the source cannot supply either piece.
    pub fn new(mut source: S) -> Result<Self, OutOfMemory> {
        // Safety: the `HeapSource` contract makes the served bytes ours to
        //         write, and `6 * WORD` is a multiple of `DWORD`.
        unsafe {
            let start = source.extend(6 * WORD).ok_or(OutOfMemory)?.as_ptr();
            let base = BlockPtr(NonNull::new_unchecked(start.add(2 * WORD)));

            ptr::write(start.cast::<usize>(), 0); // alignment padding
            base.set_tags(2 * DWORD, true);
            base.set_prev_free(ptr::null_mut());
            base.set_next_free(ptr::null_mut());
            *start.add(5 * WORD).cast::<usize>() = SIZE_USED; // epilogue

            let mut heap = Heap {
                source,
                base,
                free_head: base,
            };
            heap.extend_heap(CHUNK_SIZE).ok_or(OutOfMemory)?;
            Ok(heap)
        }
    }

    /// Attempt to allocate `size` bytes.
    ///
    /// Returns the payload address on success; `None` when `size` is zero or
    /// when the heap cannot be grown far enough. Payloads are aligned to
    /// [`DWORD`] bytes and their contents are preserved until the block is
    /// deallocated or reallocated.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let asize = adjusted_size(size)?;
        unsafe {
            let bp = match self.find_fit(asize) {
                Some(bp) => bp,
                None => self.extend_heap(asize.max(CHUNK_SIZE))?,
            };
            self.place(bp, asize);
            Some(bp.payload())
        }
    }

    /// Release a block previously returned by [`Self::allocate`] or
    /// [`Self::reallocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation of this heap. Double frees and
    /// foreign pointers are undefined behavior, as for C `free`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let bp = BlockPtr::from_payload(ptr);
        let size = bp.size();
        // The link slots are left stale here; the insertion performed at the
        // end of `coalesce` writes them.
        bp.set_tags(size, false);
        self.coalesce(bp);
    }

    /// Resize an allocation, preserving its payload.
    ///
    /// A request that still fits in the block's current size returns `ptr`
    /// unchanged; shrinking never splits, which trades internal
    /// fragmentation for a quieter free list. A growing request is first
    /// absorbed into a free forward neighbor when the combined block is
    /// large enough (again without splitting); otherwise the payload moves
    /// to a freshly allocated block and the old one is freed. A `new_size`
    /// of zero frees the block and returns `None`, and a failed allocation
    /// returns `None` with the original block untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation of this heap.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let bp = BlockPtr::from_payload(ptr);
        let old_size = bp.size();
        let asize = adjusted_size(new_size)?;
        if asize <= old_size {
            return Some(ptr);
        }

        let next = bp.next_block();
        if !next.is_used() {
            let csize = old_size + next.size();
            if csize >= asize {
                self.remove_free(next);
                bp.set_tags(csize, true);
                return Some(ptr);
            }
        }

        let new_ptr = self.allocate(new_size)?;
        // Only the payload moves; the tag words are already in place at the
        // destination.
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size - DWORD);
        self.deallocate(ptr);
        Some(new_ptr)
    }

    /// Allocate `size` bytes, C style: the failure value is a null pointer.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        self.allocate(size)
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut())
    }

    /// C-style `free`. A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must denote a live allocation of this heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.deallocate(ptr);
        }
    }

    /// C-style `realloc`. A null `ptr` behaves like [`Self::malloc`]; a zero
    /// `size` frees the block and returns null.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must denote a live allocation of this heap.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        match NonNull::new(ptr) {
            Some(ptr) => self
                .reallocate(ptr, size)
                .map(NonNull::as_ptr)
                .unwrap_or(ptr::null_mut()),
            None => self.malloc(size),
        }
    }

    /// Borrow the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutably borrow the underlying source.
    ///
    /// # Safety
    ///
    /// The returned reference must not be used to violate the `HeapSource`
    /// contract (e.g. to move or shrink the region) while `self` is alive.
    pub unsafe fn source_mut_unchecked(&mut self) -> &mut S {
        &mut self.source
    }

    /// First fit over the free list.
    ///
    /// The walk follows `next` links and stops at the first block whose used
    /// bit is set, which can only be the prologue sentinel.
    unsafe fn find_fit(&self, asize: usize) -> Option<BlockPtr> {
        let mut bp = self.free_head;
        while !bp.is_used() {
            if bp.size() >= asize {
                return Some(bp);
            }
            bp = BlockPtr(NonNull::new_unchecked(bp.next_free()));
        }
        None
    }

    /// Write used tags over the free block `bp`, splitting off the tail when
    /// the remainder can stand as a block of its own.
    ///
    /// The used tags must be written before `bp` leaves the free list: once
    /// the caller starts writing the payload, the old link slots are gone.
    /// The split remainder joins the list through the coalesce path, never
    /// directly, so it cannot end up adjacent to another free block.
    unsafe fn place(&mut self, bp: BlockPtr, asize: usize) {
        let csize = bp.size();
        if csize - asize >= MIN_BLOCK_SIZE {
            bp.set_tags(asize, true);
            self.remove_free(bp);
            let rest = bp.next_block();
            rest.set_tags(csize - asize, false);
            self.coalesce(rest);
        } else {
            bp.set_tags(csize, true);
            self.remove_free(bp);
        }
    }

    /// Merge a newly freed block with whichever physical neighbors are free
    /// and push the result onto the free list.
    ///
    /// Free neighbors are unlinked before any size is widened: after the
    /// widening their old tag positions are interior bytes of the merged
    /// block and `remove_free` would be chasing garbage. The prologue's used
    /// bit stops the backward merge at the heap base and the epilogue's
    /// stops the forward merge at the top.
    unsafe fn coalesce(&mut self, bp: BlockPtr) -> BlockPtr {
        let prev_used = *bp.prev_footer() & SIZE_USED != 0;
        let next = bp.next_block();
        let next_used = next.is_used();

        let mut bp = bp;
        let mut size = bp.size();
        match (prev_used, next_used) {
            (true, true) => {}
            (true, false) => {
                size += next.size();
                self.remove_free(next);
                bp.set_tags(size, false);
            }
            (false, true) => {
                let prev = bp.prev_block();
                size += prev.size();
                self.remove_free(prev);
                bp = prev;
                bp.set_tags(size, false);
            }
            (false, false) => {
                let prev = bp.prev_block();
                size += prev.size() + next.size();
                self.remove_free(prev);
                self.remove_free(next);
                bp = prev;
                bp.set_tags(size, false);
            }
        }

        self.insert_free(bp);
        bp
    }

    /// Grow the heap by at least `bytes`, returning the resulting free
    /// block.
    ///
    /// The new region's first word position is occupied by what used to be
    /// the epilogue header, which becomes the new block's header; a fresh
    /// epilogue is laid down at the new top. Coalescing then merges the
    /// block with a free block at the old heap tail, if any.
    unsafe fn extend_heap(&mut self, bytes: usize) -> Option<BlockPtr> {
        // Keep the heap a whole number of double words.
        let size = bytes.checked_add(DWORD - 1)? & SIZE_MASK;
        let bp = BlockPtr(self.source.extend(size)?);
        bp.set_tags(size, false);
        *bp.next_block().header() = SIZE_USED; // new epilogue
        Some(self.coalesce(bp))
    }

    /// LIFO insert at the head of the free list.
    unsafe fn insert_free(&mut self, bp: BlockPtr) {
        bp.set_next_free(self.free_head.0.as_ptr());
        self.free_head.set_prev_free(bp.0.as_ptr());
        bp.set_prev_free(ptr::null_mut());
        self.free_head = bp;
    }

    /// Splice a block out of the free list.
    ///
    /// The prologue sentinel at the tail has real link slots, so the
    /// successor-side update needs no branch.
    unsafe fn remove_free(&mut self, bp: BlockPtr) {
        let prev = bp.prev_free();
        let next = BlockPtr(NonNull::new_unchecked(bp.next_free()));
        match NonNull::new(prev) {
            None => self.free_head = next,
            Some(prev) => BlockPtr(prev).set_next_free(next.0.as_ptr()),
        }
        next.set_prev_free(prev);
    }
}

/// The consistency checker.
impl<S: HeapSource> Heap<S> {
    /// Walk the heap and the free list, cross-verifying the allocator's
    /// structural invariants.
    ///
    /// Returns the number of violations found (zero means the heap is
    /// consistent); each violation is also reported through [`log::error!`].
    /// With `verbose` set, every block is additionally dumped through
    /// [`log::debug!`]. The checker is purely diagnostic: nothing is
    /// repaired, and the walks are hardened so that even a cyclic or trashed
    /// free list cannot hang them.
    pub fn check(&self, verbose: bool) -> usize {
        let mut errors = 0;
        let lo = self.source.lo() as usize;
        let hi = self.source.hi() as usize;

        unsafe {
            if verbose {
                log::debug!(
                    "heap [{:#x}, {:#x}), prologue payload at {:#x}",
                    lo,
                    hi,
                    self.base.addr()
                );
            }

            if self.base.size() != 2 * DWORD || !self.base.is_used() {
                violation!(errors, "bad prologue tag {:#x}", *self.base.header());
            }

            // Pass 1: the physical walk, from the first post-prologue block
            // up to the epilogue. Counts blocks so pass 2 can be bounded.
            let mut block_count = 0usize;
            let mut prev_was_free = false;
            let mut bp = self.base.next_block();
            loop {
                let addr = bp.addr();
                if addr > hi {
                    violation!(errors, "heap walk ran past the top at {:#x}", addr);
                    break;
                }
                let size = bp.size();
                if size == 0 {
                    if !bp.is_used() {
                        violation!(errors, "bad epilogue tag {:#x}", *bp.header());
                    } else if addr != hi {
                        violation!(
                            errors,
                            "epilogue at {:#x} is not at the heap top {:#x}",
                            addr,
                            hi
                        );
                    }
                    break;
                }

                if verbose {
                    self.dump_block(bp);
                }
                errors += self.check_block(bp, hi);
                if !bp.is_used() {
                    if prev_was_free {
                        violation!(
                            errors,
                            "free block {:#x} follows another free block",
                            addr
                        );
                    }
                    if !self.free_list_contains(bp) {
                        violation!(
                            errors,
                            "free block {:#x} is missing from the free list",
                            addr
                        );
                    }
                }
                prev_was_free = !bp.is_used();
                block_count += 1;

                // Advance only while the size keeps the walk inside the
                // heap; `check_block` has already reported the violation
                // otherwise.
                match addr.checked_add(size).filter(|&end| end <= hi) {
                    Some(_) if size % DWORD == 0 && size >= MIN_BLOCK_SIZE => {
                        bp = bp.next_block();
                    }
                    _ => break,
                }
            }

            // Pass 2: the free-list walk, head to prologue, bounded by the
            // block count so a corrupted cycle is reported instead of
            // spinning forever.
            let mut steps = 0usize;
            let mut fp = self.free_head;
            while fp != self.base {
                if steps > block_count {
                    violation!(
                        errors,
                        "free list does not terminate at the prologue (cycle?)"
                    );
                    break;
                }
                steps += 1;

                if !plausible_payload(fp.addr(), lo, hi) {
                    violation!(
                        errors,
                        "free list entry {:#x} is outside the heap",
                        fp.addr()
                    );
                    break;
                }
                if fp.is_used() {
                    violation!(errors, "allocated block {:#x} is on the free list", fp.addr());
                }
                errors += self.check_links(fp, lo, hi);

                match NonNull::new(fp.next_free()) {
                    Some(next) => fp = BlockPtr(next),
                    None => {
                        violation!(errors, "null next link on free block {:#x}", fp.addr());
                        break;
                    }
                }
            }
        }

        errors
    }

    /// Per-block invariants: payload alignment, a sane size, and agreeing
    /// boundary tags.
    unsafe fn check_block(&self, bp: BlockPtr, hi: usize) -> usize {
        let mut errors = 0;
        if bp.addr() % DWORD != 0 {
            violation!(errors, "payload {:#x} is not double-word aligned", bp.addr());
        }
        let size = bp.size();
        if size < MIN_BLOCK_SIZE || size % DWORD != 0 {
            violation!(errors, "block {:#x} has invalid size {}", bp.addr(), size);
        } else if bp.addr().checked_add(size).map_or(true, |end| end > hi) {
            violation!(
                errors,
                "block {:#x} of size {} overruns the heap top",
                bp.addr(),
                size
            );
        } else if *bp.header() != *bp.footer() {
            violation!(
                errors,
                "block {:#x}: header {:#x} and footer {:#x} disagree",
                bp.addr(),
                *bp.header(),
                *bp.footer()
            );
        }
        errors
    }

    /// Link words of a free block must stay inside the heap and lead to free
    /// blocks. The tail's `next` is the allocated prologue sentinel, and the
    /// head's `prev` is null.
    unsafe fn check_links(&self, fp: BlockPtr, lo: usize, hi: usize) -> usize {
        let mut errors = 0;

        let next = fp.next_free() as usize;
        if !plausible_payload(next, lo, hi) {
            violation!(
                errors,
                "next link {:#x} of free block {:#x} is outside the heap",
                next,
                fp.addr()
            );
        } else if next != self.base.addr()
            && BlockPtr(NonNull::new_unchecked(next as *mut u8)).is_used()
        {
            violation!(
                errors,
                "next link of free block {:#x} leads to an allocated block",
                fp.addr()
            );
        }

        let prev = fp.prev_free() as usize;
        if prev != 0 {
            if !plausible_payload(prev, lo, hi) {
                violation!(
                    errors,
                    "prev link {:#x} of free block {:#x} is outside the heap",
                    prev,
                    fp.addr()
                );
            } else if BlockPtr(NonNull::new_unchecked(prev as *mut u8)).is_used() {
                violation!(
                    errors,
                    "prev link of free block {:#x} leads to an allocated block",
                    fp.addr()
                );
            }
        }

        errors
    }

    /// Bounded free-list membership test used by the physical walk.
    unsafe fn free_list_contains(&self, bp: BlockPtr) -> bool {
        let lo = self.source.lo() as usize;
        let hi = self.source.hi() as usize;
        let mut budget = (hi - lo) / MIN_BLOCK_SIZE + 1;
        let mut fp = self.free_head;
        while fp != self.base && budget > 0 {
            if !plausible_payload(fp.addr(), lo, hi) {
                return false;
            }
            if fp == bp {
                return true;
            }
            budget -= 1;
            match NonNull::new(fp.next_free()) {
                Some(next) => fp = BlockPtr(next),
                None => return false,
            }
        }
        false
    }

    unsafe fn dump_block(&self, bp: BlockPtr) {
        if bp.is_used() {
            log::debug!("{:#x}: used block, size {}", bp.addr(), bp.size());
        } else {
            log::debug!(
                "{:#x}: free block, size {}, prev {:p}, next {:p}",
                bp.addr(),
                bp.size(),
                bp.prev_free(),
                bp.next_free()
            );
        }
    }
}
