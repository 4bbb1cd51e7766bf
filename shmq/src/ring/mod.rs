//! Typed view over the mapped region: a four-word header followed by the
//! byte ring. Every offset computation on the shared mapping lives here.
//!
//! Cursors grow monotonically; only the index derived from them is reduced
//! modulo the capacity, at the moment memory is touched.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::QueueError;

/// Bytes taken by the length prefix of every frame.
pub const FRAME_PREFIX: usize = mem::size_of::<usize>();
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

#[repr(C)]
struct Header {
    read_cursor: AtomicUsize,
    write_cursor: AtomicUsize,
    // Zero until the initializer publishes the queue.
    capacity: AtomicUsize,
    // Producers blocked on `_space`; survives `reset`.
    space_waiters: AtomicUsize,
}

#[inline]
pub const fn frame_size(payload_len: usize) -> usize {
    FRAME_PREFIX.saturating_add(payload_len)
}

/// Total mapping size for a ring of `capacity` bytes.
#[inline]
pub const fn region_size(capacity: usize) -> usize {
    HEADER_SIZE.saturating_add(capacity)
}

/// Header and ring of one queue.
///
/// Apart from `capacity`, every method reads or mutates shared state and must
/// only be called while holding the queue mutex.
pub struct Ring {
    header: NonNull<Header>,
    data: NonNull<u8>,
    capacity: usize,
}

// The region is only mutated under the cross-process queue mutex.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Lay out a fresh header at `base`. The capacity stays unpublished until
    /// [`Ring::publish`], so attachers keep waiting meanwhile.
    ///
    /// # Safety
    ///
    /// `base` must be aligned for `usize`, valid for reads and writes of
    /// `region_size(capacity)` bytes and outlive the returned `Ring`.
    pub unsafe fn create(base: NonNull<u8>, capacity: usize) -> Ring {
        let header = base.cast::<Header>();
        // Attachers may already be polling `capacity`, so every word is
        // stored atomically rather than overwriting the header wholesale.
        let h = header.as_ref();
        h.read_cursor.store(0, Ordering::Relaxed);
        h.write_cursor.store(0, Ordering::Relaxed);
        h.space_waiters.store(0, Ordering::Relaxed);
        h.capacity.store(0, Ordering::Release);
        Ring {
            header,
            data: NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE)),
            capacity,
        }
    }

    /// View a region laid out by another handle, waiting up to `timeout` for
    /// its creator to publish the capacity.
    ///
    /// # Safety
    ///
    /// `base` must be aligned for `usize`, valid for reads and writes of `len`
    /// bytes and outlive the returned `Ring`. The region must either be
    /// zero-filled or hold a header written by [`Ring::create`].
    pub unsafe fn attach(
        base: NonNull<u8>,
        len: usize,
        name: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Ring, QueueError> {
        if len < HEADER_SIZE {
            return Err(QueueError::Layout {
                name: name.to_string(),
                len,
                required: HEADER_SIZE,
            });
        }
        let header = base.cast::<Header>();
        let started = Instant::now();
        let capacity = loop {
            let capacity = header.as_ref().capacity.load(Ordering::Acquire);
            if capacity != 0 {
                break capacity;
            }
            if started.elapsed() >= timeout {
                return Err(QueueError::NotInitialized(name.to_string()));
            }
            thread::sleep(poll);
        };
        let required = region_size(capacity);
        if len < required {
            return Err(QueueError::Layout {
                name: name.to_string(),
                len,
                required,
            });
        }
        Ok(Ring {
            header,
            data: NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE)),
            capacity,
        })
    }

    /// Make the ring visible to attachers. Must be the last initialization step.
    pub fn publish(&self) {
        self.header().capacity.store(self.capacity, Ordering::Release);
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        let header = self.header();
        let write = header.write_cursor.load(Ordering::Acquire);
        let read = header.read_cursor.load(Ordering::Acquire);
        let used = write.wrapping_sub(read);
        assert!(
            used <= self.capacity,
            "invariant violation: {} bytes in use in a ring of {} (read={}, write={})",
            used,
            self.capacity,
            read,
            write
        );
        used
    }

    #[inline]
    pub fn available_bytes(&self) -> usize {
        self.capacity - self.used_bytes()
    }

    pub fn space_waiters(&self) -> usize {
        self.header().space_waiters.load(Ordering::Acquire)
    }

    pub fn add_space_waiter(&self) {
        self.header().space_waiters.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_space_waiter(&self) {
        let prev = self.header().space_waiters.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "invariant violation: no producer was waiting");
    }

    /// Rewind both cursors. Registered waiters are still blocked, so their
    /// count is kept.
    pub fn reset(&self) {
        let header = self.header();
        header.read_cursor.store(0, Ordering::Release);
        header.write_cursor.store(0, Ordering::Release);
    }

    pub fn write_raw(&self, bytes: &[u8]) {
        let available = self.available_bytes();
        assert!(
            bytes.len() <= available,
            "invariant violation: writing {} bytes with {} available",
            bytes.len(),
            available
        );
        let header = self.header();
        let write = header.write_cursor.load(Ordering::Acquire);
        let pos = write % self.capacity;
        let first = (self.capacity - pos).min(bytes.len());
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(pos), first);
            if first < bytes.len() {
                ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    self.data.as_ptr(),
                    bytes.len() - first,
                );
            }
        }
        header
            .write_cursor
            .store(write.wrapping_add(bytes.len()), Ordering::Release);
    }

    pub fn read_raw(&self, out: &mut [u8]) {
        let used = self.used_bytes();
        assert!(
            out.len() <= used,
            "invariant violation: reading {} bytes with {} in use",
            out.len(),
            used
        );
        let header = self.header();
        let read = header.read_cursor.load(Ordering::Acquire);
        let pos = read % self.capacity;
        let first = (self.capacity - pos).min(out.len());
        unsafe {
            ptr::copy_nonoverlapping(self.data.as_ptr().add(pos), out.as_mut_ptr(), first);
            if first < out.len() {
                ptr::copy_nonoverlapping(
                    self.data.as_ptr(),
                    out.as_mut_ptr().add(first),
                    out.len() - first,
                );
            }
        }
        header
            .read_cursor
            .store(read.wrapping_add(out.len()), Ordering::Release);
    }

    /// Append one frame. Oversized frames are rejected without touching the
    /// ring; the caller must already have checked that the frame fits in the
    /// currently available space.
    pub fn write_frame(&self, payload: &[u8]) -> Result<(), QueueError> {
        let frame = frame_size(payload.len());
        if frame >= self.capacity {
            return Err(QueueError::MessageTooLarge {
                frame,
                capacity: self.capacity,
            });
        }
        let available = self.available_bytes();
        assert!(
            frame <= available,
            "invariant violation: frame of {} bytes with {} available",
            frame,
            available
        );
        self.write_raw(&payload.len().to_ne_bytes());
        self.write_raw(payload);
        Ok(())
    }

    /// Pop the oldest frame. The caller must have seen `used_bytes() > 0`.
    pub fn read_frame(&self) -> Vec<u8> {
        let mut prefix = [0u8; FRAME_PREFIX];
        self.read_raw(&mut prefix);
        let len = usize::from_ne_bytes(prefix);
        let remaining = self.used_bytes();
        assert!(
            len <= remaining,
            "invariant violation: frame announces {} bytes, {} remain",
            len,
            remaining
        );
        let mut payload = vec![0u8; len];
        self.read_raw(&mut payload);
        payload
    }
}
