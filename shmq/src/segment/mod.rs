use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::thread;
use std::time::{Duration, Instant};

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info};

use crate::errors::QueueError;

pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
pub const ATTACH_POLL: Duration = Duration::from_millis(1);

/// One process's mapping of a named shared memory object.
pub struct SharedSegment {
    shmem: Shmem,
    created: bool,
}

// The mapping is plain memory; synchronisation is up to the users of `as_ptr`.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create `os_id` with `size` bytes, or map it if another process got
    /// there first. Creation is exclusive, so exactly one caller ever sees
    /// `created() == true` for a given incarnation of the object.
    ///
    /// A created segment is owned until [`SharedSegment::persist`]: dropping
    /// it before then removes the object again.
    pub fn create_or_attach(os_id: &str, size: usize) -> Result<Self, QueueError> {
        let started = Instant::now();
        loop {
            match ShmemConf::new().os_id(os_id).size(size).create() {
                Ok(shmem) => {
                    info!(segment = %os_id, size, "created shared memory segment");
                    return Ok(SharedSegment {
                        shmem,
                        created: true,
                    });
                }
                Err(ShmemError::MappingIdExists) => {}
                Err(e) => return Err(segment_error(os_id, e)),
            }
            // Someone else owns it. The open can fail transiently while the
            // creator is still sizing the object, or if it was unlinked in
            // between; in the latter case the next create wins.
            match ShmemConf::new().os_id(os_id).open() {
                Ok(shmem) => {
                    debug!(segment = %os_id, len = shmem.len(), "attached shared memory segment");
                    return Ok(SharedSegment {
                        shmem,
                        created: false,
                    });
                }
                Err(e @ ShmemError::MapOpenFailed(_)) | Err(e @ ShmemError::MapCreateFailed(_)) => {
                    if started.elapsed() >= ATTACH_TIMEOUT {
                        return Err(segment_error(os_id, e));
                    }
                    thread::sleep(ATTACH_POLL);
                }
                Err(e) => return Err(segment_error(os_id, e)),
            }
        }
    }

    /// Stop owning the object: it now outlives this mapping.
    pub fn persist(&mut self) {
        self.shmem.set_owner(false);
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        // A live mapping is never at address zero.
        NonNull::new(self.shmem.as_ptr()).unwrap_or_else(NonNull::dangling)
    }

    /// Remove `os_id` from the system. Already-removed objects are not an error.
    pub fn unlink(os_id: &str) -> Result<bool, QueueError> {
        let c = CString::new(os_id)
            .map_err(|_| QueueError::InvalidName(os_id.to_string()))?;
        if unsafe { libc::shm_unlink(c.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(QueueError::Unlink {
                name: os_id.to_string(),
                source: err,
            })
        }
    }
}

fn segment_error(os_id: &str, source: ShmemError) -> QueueError {
    QueueError::SharedMemory {
        name: os_id.to_string(),
        source,
    }
}
