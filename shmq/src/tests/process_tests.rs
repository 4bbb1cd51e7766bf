use std::env;
use std::error::Error;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{TestMessage, TestQueue};
use crate::Queue;

const REQUESTS_ENV: &str = "SHMQ_ECHO_REQUESTS";
const REPLIES_ENV: &str = "SHMQ_ECHO_REPLIES";
const MESSAGES: u32 = 40;
const DEADLINE: Duration = Duration::from_secs(30);

/// Runs in the child process only: echoes every request reversed until an
/// empty frame arrives. A no-op in a normal test run.
#[test]
fn echo_child() -> Result<(), Box<dyn Error>> {
    let (requests, replies) = match (env::var(REQUESTS_ENV), env::var(REPLIES_ENV)) {
        (Ok(requests), Ok(replies)) => (requests, replies),
        _ => return Ok(()),
    };
    let requests = Queue::open(&requests, 4096)?;
    let replies = Queue::open(&replies, 256)?;
    assert!(!requests.is_initializer());
    assert!(!replies.is_initializer());
    loop {
        let mut payload = requests.receive()?;
        if payload.is_empty() {
            return Ok(());
        }
        payload.reverse();
        replies.send(&payload)?;
    }
}

// Kills the child if the parent side fails first.
struct Reaped(Child);

impl Drop for Reaped {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn round_trip_through_another_process() -> Result<(), Box<dyn Error>> {
    let requests = TestQueue::new("proc_requests");
    let replies = TestQueue::new("proc_replies");
    // Holds every request, so only the reply direction ever blocks.
    let req = requests.open(4096)?;
    // Too small for all replies, so the child blocks until this side reads.
    let rep = replies.open(256)?;

    let mut child = Reaped(
        Command::new(env::current_exe()?)
            .args(["tests::process_tests::echo_child", "--exact", "--test-threads=1"])
            .env(REQUESTS_ENV, &requests.name)
            .env(REPLIES_ENV, &replies.name)
            .stdout(Stdio::null())
            .spawn()?,
    );

    for seq in 0..MESSAGES {
        req.send(&TestMessage::new(9, seq, 16).to_bytes())?;
    }
    req.send(b"")?;

    let started = Instant::now();
    let mut seq = 0;
    while seq < MESSAGES {
        match rep.try_receive()? {
            Some(mut bytes) => {
                bytes.reverse();
                let msg = TestMessage::from_bytes(&bytes).expect("truncated reply");
                assert_eq!(msg.seq, seq, "out of order");
                assert!(msg.is_consistent(), "corrupted reply {:?}", msg);
                seq += 1;
            }
            None => {
                if let Some(status) = child.0.try_wait()? {
                    panic!("child exited early with {} after {} replies", status, seq);
                }
                assert!(started.elapsed() < DEADLINE, "child stalled after {} replies", seq);
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    assert!(child.0.wait()?.success(), "child failed");
    assert_eq!(rep.try_receive()?, None);
    assert_eq!(req.stats()?.used_bytes, 0);
    Ok(())
}
