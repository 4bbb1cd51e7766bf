mod process_tests;

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use crate::{cleanup, Queue, QueueError};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
});

/// A queue name private to one test; its resources are removed on drop.
pub(crate) struct TestQueue {
    pub name: String,
}

impl TestQueue {
    pub fn new(tag: &str) -> Self {
        Lazy::force(&TRACING);
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let name = format!(
            "shmq_{}_{}_{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let _ = cleanup(&name);
        TestQueue { name }
    }

    pub fn open(&self, capacity: usize) -> Result<Queue, QueueError> {
        Queue::open(&self.name, capacity)
    }
}

impl Drop for TestQueue {
    fn drop(&mut self) {
        let _ = cleanup(&self.name);
    }
}

/// Payload that can be checked for corruption after the trip through the ring.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TestMessage {
    pub producer: u32,
    pub seq: u32,
    pub data: Vec<u8>,
}

impl TestMessage {
    pub fn new(producer: u32, seq: u32, size: usize) -> Self {
        let val = ((producer * 31 + seq) % 251) as u8;
        TestMessage {
            producer,
            seq,
            data: vec![val; size],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.data.len());
        bytes.extend_from_slice(&self.producer.to_le_bytes());
        bytes.extend_from_slice(&self.seq.to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        Some(TestMessage {
            producer: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            seq: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            data: bytes[8..].to_vec(),
        })
    }

    pub fn is_consistent(&self) -> bool {
        let expected = ((self.producer * 31 + self.seq) % 251) as u8;
        self.data.iter().all(|&b| b == expected)
    }
}
