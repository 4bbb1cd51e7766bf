use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("shared memory error on `{name}`: {source}")]
    SharedMemory {
        name: String,
        #[source]
        source: shared_memory::ShmemError,
    },
    #[error("semaphore `{name}`: {op} failed: {source}")]
    Semaphore {
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to unlink `{name}`: {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid queue name {0:?}")]
    InvalidName(String),
    #[error("invalid capacity {capacity}: must be larger than the {prefix}-byte frame prefix")]
    InvalidCapacity { capacity: usize, prefix: usize },
    #[error("queue `{0}` was created but never finished initializing")]
    NotInitialized(String),
    #[error("queue `{name}` mapping is {len} bytes, layout requires {required}")]
    Layout {
        name: String,
        len: usize,
        required: usize,
    },
    #[error("frame of {frame} bytes does not fit in a ring of {capacity} bytes")]
    MessageTooLarge { frame: usize, capacity: usize },
    #[error("queue is full")]
    Full,
    #[error("config error: {0}")]
    Config(#[from] confy::ConfyError),
}

impl QueueError {
    pub(crate) fn semaphore(name: &str, op: &'static str, source: io::Error) -> Self {
        QueueError::Semaphore {
            name: name.to_string(),
            op,
            source,
        }
    }

    /// True for failures acquiring or validating the named OS resources.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            QueueError::SharedMemory { .. }
                | QueueError::Semaphore { .. }
                | QueueError::Unlink { .. }
                | QueueError::InvalidName(_)
                | QueueError::InvalidCapacity { .. }
                | QueueError::NotInitialized(_)
                | QueueError::Layout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_resource_errors() {
        let err = QueueError::semaphore(
            "/q_mutex",
            "sem_open",
            io::Error::from_raw_os_error(libc::EACCES),
        );
        assert!(err.is_resource_error());
        assert!(err.to_string().contains("/q_mutex"));
        assert!(err.to_string().contains("sem_open"));

        let err = QueueError::SharedMemory {
            name: "/q".to_string(),
            source: shared_memory::ShmemError::MappingIdExists,
        };
        assert!(err.is_resource_error());
        assert!(err.to_string().starts_with("shared memory error on `/q`"));

        let err = QueueError::MessageTooLarge {
            frame: 300,
            capacity: 256,
        };
        assert!(!err.is_resource_error());
        assert!(!QueueError::Full.is_resource_error());
    }
}
