//! POSIX named semaphores. They live in the kernel under their name until
//! unlinked, so every process opening the same name shares one counter.

use std::ffi::CString;
use std::io;

use crate::errors::QueueError;

const MODE: libc::c_uint = 0o600;

pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// sem_* calls are thread safe on a shared handle.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> Result<CString, QueueError> {
    CString::new(name).map_err(|_| QueueError::InvalidName(name.to_string()))
}

impl NamedSemaphore {
    /// Create a new semaphore, failing if `name` already exists.
    pub fn create(name: &str, initial: u32) -> Result<Self, QueueError> {
        let c = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                MODE,
                initial as libc::c_uint,
            )
        };
        Self::from_raw(sem, name, "sem_open(create)")
    }

    /// Open an existing semaphore.
    pub fn open(name: &str) -> Result<Self, QueueError> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        Self::from_raw(sem, name, "sem_open")
    }

    fn from_raw(sem: *mut libc::sem_t, name: &str, op: &'static str) -> Result<Self, QueueError> {
        if sem == libc::SEM_FAILED {
            return Err(QueueError::semaphore(name, op, io::Error::last_os_error()));
        }
        Ok(NamedSemaphore {
            sem,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the count is positive, then decrement it.
    pub fn acquire(&self) -> Result<(), QueueError> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(QueueError::semaphore(&self.name, "sem_wait", err));
            }
        }
    }

    /// Decrement without blocking. `Ok(false)` when the count was zero.
    pub fn try_acquire(&self) -> Result<bool, QueueError> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(QueueError::semaphore(&self.name, "sem_trywait", err)),
            }
        }
    }

    pub fn release(&self) -> Result<(), QueueError> {
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(QueueError::semaphore(
                &self.name,
                "sem_post",
                io::Error::last_os_error(),
            ))
        }
    }

    /// Current count. Unsupported on macOS, where this returns an error.
    pub fn value(&self) -> Result<u32, QueueError> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            return Err(QueueError::semaphore(
                &self.name,
                "sem_getvalue",
                io::Error::last_os_error(),
            ));
        }
        // Linux never reports waiters as a negative count, other systems may.
        Ok(value.max(0) as u32)
    }

    /// Post unless a signal is already pending. Waiters re-check shared state
    /// after waking, so one pending signal wakes them as well as several would.
    pub fn release_coalesced(&self) -> Result<(), QueueError> {
        match self.value() {
            Ok(pending) if pending > 0 => Ok(()),
            _ => self.release(),
        }
    }

    /// Post until `target` signals are pending, so each of `target` waiters
    /// wakes at least once. Where the count cannot be read, posts `target`
    /// times. Returns the number of posts.
    pub fn top_up(&self, target: usize) -> Result<usize, QueueError> {
        let pending = self.value().map_or(0, |v| v as usize);
        let missing = target.saturating_sub(pending);
        for _ in 0..missing {
            self.release()?;
        }
        Ok(missing)
    }

    /// Decrement until the count is zero; returns how many signals were dropped.
    pub fn drain(&self) -> Result<usize, QueueError> {
        let mut drained = 0;
        while self.try_acquire()? {
            drained += 1;
        }
        Ok(drained)
    }

    /// Remove `name` from the system. Already-removed names are not an error.
    pub fn unlink(name: &str) -> Result<bool, QueueError> {
        let c = c_name(name)?;
        if unsafe { libc::sem_unlink(c.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(QueueError::semaphore(name, "sem_unlink", err))
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}
