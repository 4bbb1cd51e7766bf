//! Queue handle: one process's view of a named queue.
//!
//! All header and ring access happens under the `_mutex` semaphore. The
//! `_space` and `_data` semaphores only wake blocked producers and consumers;
//! a woken caller always re-checks the ring under the mutex.
//!
//! Producers need differing amounts of room, so a blocked producer registers
//! itself in the header and every read wakes all registered producers. A
//! single wake could land on one whose frame still does not fit while a
//! smaller one keeps sleeping.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::config::{QueueConfig, DEFAULT_CAPACITY};
use crate::errors::QueueError;
use crate::ring::{self, Ring, FRAME_PREFIX};
use crate::segment::{SharedSegment, ATTACH_POLL, ATTACH_TIMEOUT};
use crate::semaphore::NamedSemaphore;

/// Kernel object names backing one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub segment: String,
    pub mutex: String,
    pub space: String,
    pub data: String,
}

impl ResourceNames {
    pub fn new(name: &str) -> Result<Self, QueueError> {
        let stem = name.strip_prefix('/').unwrap_or(name);
        if stem.is_empty() || stem.contains('/') || stem.contains('\0') {
            return Err(QueueError::InvalidName(name.to_string()));
        }
        let segment = format!("/{}", stem);
        Ok(ResourceNames {
            mutex: format!("{}_mutex", segment),
            space: format!("{}_space", segment),
            data: format!("{}_data", segment),
            segment,
        })
    }

    fn semaphores(&self) -> [&str; 3] {
        [&self.mutex, &self.space, &self.data]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub used_bytes: usize,
    pub available_bytes: usize,
    /// Producers blocked in `send`.
    pub waiting_producers: usize,
    /// `None` where the platform cannot report semaphore counts.
    pub pending_data_signals: Option<u32>,
    pub pending_space_signals: Option<u32>,
}

pub struct Queue {
    name: String,
    ring: Ring,
    mutex: NamedSemaphore,
    space_available: NamedSemaphore,
    data_available: NamedSemaphore,
    segment: SharedSegment,
    initializer: bool,
}

struct MutexGuard<'a>(&'a NamedSemaphore);

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.release() {
            error!(semaphore = %self.0.name(), error = %e, "failed to release queue mutex");
        }
    }
}

impl Queue {
    /// Create the queue `name` with a ring of `capacity` bytes, or attach to
    /// it if it already exists. An existing queue keeps its own capacity.
    pub fn open(name: &str, capacity: usize) -> Result<Queue, QueueError> {
        let names = ResourceNames::new(name)?;
        if capacity <= FRAME_PREFIX {
            return Err(QueueError::InvalidCapacity {
                capacity,
                prefix: FRAME_PREFIX,
            });
        }
        let segment =
            SharedSegment::create_or_attach(&names.segment, ring::region_size(capacity))?;
        if segment.created() {
            Self::initialize(name, &names, segment, capacity)
        } else {
            Self::attach(name, &names, segment, capacity)
        }
    }

    pub fn open_default(name: &str) -> Result<Queue, QueueError> {
        Self::open(name, DEFAULT_CAPACITY)
    }

    pub fn with_config(cfg: &QueueConfig) -> Result<Queue, QueueError> {
        Self::open(&cfg.name, cfg.capacity)
    }

    fn initialize(
        name: &str,
        names: &ResourceNames,
        segment: SharedSegment,
        capacity: usize,
    ) -> Result<Queue, QueueError> {
        // Attachers wait for the ring to be published before touching the
        // semaphores, so leftovers from an earlier incarnation can be replaced.
        for sem in names.semaphores() {
            if NamedSemaphore::unlink(sem)? {
                warn!(queue = %name, semaphore = %sem, "removed stale semaphore");
            }
        }
        let (mutex, space_available, data_available) = match create_semaphores(names) {
            Ok(sems) => sems,
            Err(e) => {
                unlink_semaphores(names);
                return Err(e);
            }
        };
        // SAFETY: the segment was created with region_size(capacity) bytes and
        // is owned by the queue together with the ring.
        let ring = unsafe { Ring::create(segment.as_ptr(), capacity) };
        let mut queue = Queue {
            name: name.to_string(),
            ring,
            mutex,
            space_available,
            data_available,
            segment,
            initializer: true,
        };
        if let Err(e) = queue.clear() {
            // Dropping the still-owned segment removes it.
            drop(queue);
            unlink_semaphores(names);
            return Err(e);
        }
        queue.ring.publish();
        queue.segment.persist();
        info!(queue = %name, capacity, "created queue");
        Ok(queue)
    }

    fn attach(
        name: &str,
        names: &ResourceNames,
        segment: SharedSegment,
        requested: usize,
    ) -> Result<Queue, QueueError> {
        // SAFETY: the mapping is segment.len() bytes, page aligned, and lives
        // as long as the queue that owns both.
        let ring = unsafe {
            Ring::attach(
                segment.as_ptr(),
                segment.len(),
                name,
                ATTACH_TIMEOUT,
                ATTACH_POLL,
            )?
        };
        if ring.capacity() != requested {
            warn!(
                queue = %name,
                requested,
                capacity = ring.capacity(),
                "queue exists with a different capacity, using the existing one"
            );
        }
        let queue = Queue {
            name: name.to_string(),
            mutex: NamedSemaphore::open(&names.mutex)?,
            space_available: NamedSemaphore::open(&names.space)?,
            data_available: NamedSemaphore::open(&names.data)?,
            ring,
            segment,
            initializer: false,
        };
        info!(queue = %name, capacity = queue.capacity(), "attached to queue");
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// True if this handle created and initialized the shared queue.
    pub fn is_initializer(&self) -> bool {
        self.initializer
    }

    fn locked<R, F>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&Ring) -> R,
    {
        self.mutex.acquire()?;
        let _guard = MutexGuard(&self.mutex);
        Ok(f(&self.ring))
    }

    fn check_frame(&self, payload_len: usize) -> Result<usize, QueueError> {
        let frame = ring::frame_size(payload_len);
        if frame >= self.ring.capacity() {
            return Err(QueueError::MessageTooLarge {
                frame,
                capacity: self.ring.capacity(),
            });
        }
        Ok(frame)
    }

    /// Write the frame if it fits right now.
    fn write_locked(&self, payload: &[u8], frame: usize) -> Result<bool, QueueError> {
        self.locked(|ring| {
            if ring.available_bytes() < frame {
                return Ok(false);
            }
            ring.write_frame(payload)?;
            Ok(true)
        })?
    }

    /// Pop a frame if there is one. `Some((payload, more_left))` on success.
    fn read_locked(&self) -> Result<Option<(Vec<u8>, bool)>, QueueError> {
        self.locked(|ring| {
            if ring.used_bytes() == 0 {
                return Ok(None);
            }
            let payload = ring.read_frame();
            self.wake_producers(ring)?;
            Ok(Some((payload, ring.used_bytes() > 0)))
        })?
    }

    // Called with the mutex held, so no producer can register in between.
    fn wake_producers(&self, ring: &Ring) -> Result<(), QueueError> {
        self.space_available.top_up(ring.space_waiters())?;
        Ok(())
    }

    fn after_read(&self, more_left: bool) -> Result<(), QueueError> {
        if more_left {
            // Another consumer may be blocked on a signal this one consumed.
            self.data_available.release_coalesced()?;
        }
        Ok(())
    }

    /// Enqueue `payload`, blocking while the ring lacks room for it.
    ///
    /// Payloads whose frame could never fit fail with
    /// [`QueueError::MessageTooLarge`] straight away.
    pub fn send(&self, payload: &[u8]) -> Result<(), QueueError> {
        let frame = self.check_frame(payload.len())?;
        let mut registered = false;
        loop {
            let written = self.locked(|ring| -> Result<bool, QueueError> {
                if registered {
                    ring.remove_space_waiter();
                }
                if ring.available_bytes() < frame {
                    ring.add_space_waiter();
                    return Ok(false);
                }
                ring.write_frame(payload)?;
                Ok(true)
            })??;
            if written {
                return self.data_available.release_coalesced();
            }
            registered = true;
            if let Err(e) = self.space_available.acquire() {
                self.locked(|ring| ring.remove_space_waiter())?;
                return Err(e);
            }
        }
    }

    /// Like [`Queue::send`] but fails with [`QueueError::Full`] instead of
    /// blocking.
    pub fn try_send(&self, payload: &[u8]) -> Result<(), QueueError> {
        let frame = self.check_frame(payload.len())?;
        if self.write_locked(payload, frame)? {
            self.data_available.release_coalesced()
        } else {
            Err(QueueError::Full)
        }
    }

    /// Dequeue the oldest frame, blocking until one is available.
    pub fn receive(&self) -> Result<Vec<u8>, QueueError> {
        loop {
            self.data_available.acquire()?;
            if let Some((payload, more_left)) = self.read_locked()? {
                self.after_read(more_left)?;
                return Ok(payload);
            }
        }
    }

    pub fn try_receive(&self) -> Result<Option<Vec<u8>>, QueueError> {
        match self.read_locked()? {
            Some((payload, more_left)) => {
                self.after_read(more_left)?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Drop every queued frame and pending wake signal. Producers blocked in
    /// `send` are woken to retry against the emptied ring.
    pub fn clear(&self) -> Result<(), QueueError> {
        let (space, data) = self.locked(|ring| -> Result<(usize, usize), QueueError> {
            ring.reset();
            let dropped = (self.space_available.drain()?, self.data_available.drain()?);
            self.wake_producers(ring)?;
            Ok(dropped)
        })??;
        debug!(
            queue = %self.name,
            dropped_space_signals = space,
            dropped_data_signals = data,
            "cleared queue"
        );
        Ok(())
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let (used_bytes, available_bytes, waiting_producers) = self.locked(|ring| {
            (ring.used_bytes(), ring.available_bytes(), ring.space_waiters())
        })?;
        Ok(QueueStats {
            capacity: self.ring.capacity(),
            used_bytes,
            available_bytes,
            waiting_producers,
            pending_data_signals: self.data_available.value().ok(),
            pending_space_signals: self.space_available.value().ok(),
        })
    }

    /// Unmap and close this handle. The named queue stays available to others.
    pub fn close(self) {
        drop(self)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        debug!(queue = %self.name, segment = %self.segment.os_id(), "closed queue handle");
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("capacity", &self.ring.capacity())
            .field("initializer", &self.initializer)
            .finish()
    }
}

fn create_semaphores(
    names: &ResourceNames,
) -> Result<(NamedSemaphore, NamedSemaphore, NamedSemaphore), QueueError> {
    Ok((
        NamedSemaphore::create(&names.mutex, 1)?,
        NamedSemaphore::create(&names.space, 0)?,
        NamedSemaphore::create(&names.data, 0)?,
    ))
}

fn unlink_semaphores(names: &ResourceNames) {
    for sem in names.semaphores() {
        if let Err(e) = NamedSemaphore::unlink(sem) {
            warn!(semaphore = %sem, error = %e, "failed to remove semaphore");
        }
    }
}

/// Remove the named queue from the system. Handles still open keep their
/// mappings, but later opens of `name` start a brand-new, empty queue.
/// Resources that are already gone are skipped.
pub fn cleanup(name: &str) -> Result<(), QueueError> {
    let names = ResourceNames::new(name)?;
    let results = std::iter::once(SharedSegment::unlink(&names.segment))
        .chain(names.semaphores().into_iter().map(NamedSemaphore::unlink));
    let mut removed = false;
    let mut first_err = None;
    for res in results {
        match res {
            Ok(r) => removed |= r,
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    if removed {
        info!(queue = %name, "removed queue resources");
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_share_a_stem() -> Result<(), QueueError> {
        let names = ResourceNames::new("orders")?;
        assert_eq!(names.segment, "/orders");
        assert_eq!(names.mutex, "/orders_mutex");
        assert_eq!(names.space, "/orders_space");
        assert_eq!(names.data, "/orders_data");
        assert_eq!(ResourceNames::new("/orders")?, names);
        Ok(())
    }

    #[test]
    fn rejects_unusable_names() {
        for name in ["", "/", "a/b", "/a/b", "nul\0"] {
            assert!(
                matches!(ResourceNames::new(name), Err(QueueError::InvalidName(_))),
                "accepted {:?}",
                name
            );
        }
    }
}
