use core::cell::Cell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::slice;

/// Every block handed out by a [`StackArena`] starts on this boundary, and
/// every reservation is rounded up to a multiple of it.
pub const ARENA_ALIGN: usize = 16;

/// A fixed-capacity stack allocator. Blocks must be released in exactly the
/// reverse order they were handed out; [`Scratch`] guards do this on drop.
///
/// The storage must own or borrow a heap/static buffer whose address does not
/// change when the arena itself is moved (`Box<[u8]>`, `Vec<u8>`, `&mut
/// [u8]`), because the aligned base pointer is computed once in `new`.
pub struct StackArena<S> {
    /// Keeps the backing buffer alive. Always initialized; dropped in
    /// `Drop`. N.B. Wrapped in `MaybeUninit` so that moving the arena does
    /// not reassert unique ownership of a `Box` buffer and invalidate
    /// `base`, which was derived from it in place.
    storage: MaybeUninit<S>,

    /// First aligned byte of the buffer.
    base: NonNull<u8>,

    /// Usable bytes starting at `base`, rounded down to `ARENA_ALIGN`.
    capacity: usize,

    /// Bytes currently reserved. Always a multiple of `ARENA_ALIGN`.
    depth: Cell<usize>,

    /// High-water mark of `depth`.
    peak: Cell<usize>,
}

// SAFETY: the arena owns (or exclusively borrows) its buffer. It is not `Sync`
// because `depth` is a `Cell`, so a shared arena is only ever used from one
// thread at a time, which callers arrange with a lock.
unsafe impl<S: Send> Send for StackArena<S> {}

impl<S: DerefMut<Target = [u8]>> StackArena<S> {
    pub fn new(storage: S) -> Self {
        let mut arena = Self {
            storage: MaybeUninit::new(storage),
            base: NonNull::dangling(),
            capacity: 0,
            depth: Cell::new(0),
            peak: Cell::new(0),
        };

        // SAFETY: `storage` was initialized just above.
        let buf: &mut [u8] = unsafe { arena.storage.assume_init_mut() };
        let len = buf.len();
        let shift = buf.as_ptr().align_offset(ARENA_ALIGN).min(len);
        arena.capacity = (len - shift) & !(ARENA_ALIGN - 1);

        // SAFETY: `shift <= len`, so the offset pointer is in bounds (or one
        // past the end for an empty buffer) and therefore non-null.
        arena.base = unsafe { NonNull::new_unchecked(buf.as_mut_ptr().add(shift)) };
        arena
    }
}

impl<S> Drop for StackArena<S> {
    fn drop(&mut self) {
        // SAFETY: `storage` is initialized in `new` and only dropped here.
        unsafe { self.storage.assume_init_drop() };
    }
}

impl<S> StackArena<S> {
    /// Usable bytes in the arena.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently reserved, including alignment padding.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.depth.get()
    }

    /// The largest `depth` ever observed.
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Hands out a block of `size` bytes. Panics if the arena is exhausted.
    pub fn alloc(&self, size: usize) -> Scratch<'_, S> {
        self.try_alloc(size).unwrap_or_else(|| {
            panic!(
                "stack arena exhausted: requested {size} bytes with {} of {} left",
                self.remaining(),
                self.capacity
            )
        })
    }

    /// Like [`alloc`](Self::alloc), but returns `None` when the arena cannot
    /// satisfy the request.
    pub fn try_alloc(&self, size: usize) -> Option<Scratch<'_, S>> {
        let reserved = reservation(size)?;
        let depth = self.depth.get();
        if reserved > self.capacity - depth {
            return None;
        }

        // SAFETY: `depth + reserved <= capacity`, so the block lies inside the
        // buffer, and no outstanding block overlaps it because every earlier
        // block ends at or before `depth`.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(depth)) };
        self.depth.set(depth + reserved);
        if depth + reserved > self.peak.get() {
            self.peak.set(depth + reserved);
        }

        Some(Scratch {
            arena: self,
            ptr,
            len: size,
            reserved,
        })
    }

    /// Like [`try_alloc`](Self::try_alloc), with the block zero-filled.
    pub fn try_alloc_zeroed(&self, size: usize) -> Option<Scratch<'_, S>> {
        let mut block = self.try_alloc(size)?;
        block.fill(0);
        Some(block)
    }

    /// Releases the block at `ptr` that reserved `reserved` bytes. Panics if
    /// it is not the most recent outstanding block.
    fn free(&self, ptr: NonNull<u8>, reserved: usize) {
        let depth = self.depth.get();
        let top = self.base.as_ptr() as usize + depth;
        assert!(
            reserved <= depth && ptr.as_ptr() as usize == top - reserved,
            "stack arena blocks must be freed in LIFO order"
        );
        self.depth.set(depth - reserved);
    }
}

impl<S> fmt::Debug for StackArena<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackArena")
            .field("capacity", &self.capacity)
            .field("depth", &self.depth.get())
            .field("peak", &self.peak.get())
            .finish()
    }
}

fn reservation(size: usize) -> Option<usize> {
    assert!(size > 0, "cannot allocate 0 bytes");
    size.checked_add(ARENA_ALIGN - 1)
        .map(|padded| padded & !(ARENA_ALIGN - 1))
}

/// A block borrowed from a [`StackArena`]. Dropping it returns the bytes to
/// the arena, which panics if a younger block is still outstanding.
pub struct Scratch<'a, S> {
    arena: &'a StackArena<S>,
    ptr: NonNull<u8>,
    len: usize,
    reserved: usize,
}

impl<S> Scratch<'_, S> {
    /// Bytes actually taken from the arena, including padding.
    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

impl<S> Deref for Scratch<'_, S> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the block is inside the arena buffer and exclusively ours
        // until drop.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<S> DerefMut for Scratch<'_, S> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `deref`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<S> Drop for Scratch<'_, S> {
    fn drop(&mut self) {
        self.arena.free(self.ptr, self.reserved);
    }
}

impl<S> fmt::Debug for Scratch<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratch")
            .field("len", &self.len)
            .field("reserved", &self.reserved)
            .finish()
    }
}
