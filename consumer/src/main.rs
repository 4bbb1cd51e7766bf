use std::error::Error;
use std::process;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use shmq::{Queue, QueueConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    #[clap(short = 'n', long = "name")]
    name: Option<String>,
    #[clap(long)]
    capacity: Option<usize>,
    /// Stop after this many messages instead of running until killed.
    #[clap(long)]
    count: Option<usize>,
    /// Remove the queue from the system when interrupted.
    #[clap(long)]
    cleanup_on_exit: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(default)]
struct ConsumerConfig {
    queue: QueueConfig,
    count: Option<usize>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: ConsumerConfig = match &opts.config {
        Some(path) => confy::load_path(path)?,
        None => ConsumerConfig::default(),
    };
    if let Some(name) = opts.name {
        cfg.queue.name = name;
    }
    if let Some(capacity) = opts.capacity {
        cfg.queue.capacity = capacity;
    }
    if opts.count.is_some() {
        cfg.count = opts.count;
    }

    let queue = Queue::with_config(&cfg.queue)?;
    if opts.cleanup_on_exit {
        cleanup_on_signal(queue.name().to_string())?;
    }
    run(&queue, cfg.count)?;
    Ok(())
}

// A blocked receive cannot be cancelled, so the handler exits the process
// itself once the queue is gone.
fn cleanup_on_signal(name: String) -> Result<(), Box<dyn Error>> {
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, queue = %name, "removing queue before exit");
            if let Err(e) = shmq::cleanup(&name) {
                error!(queue = %name, error = %e, "cleanup failed");
                process::exit(1);
            }
            process::exit(0);
        }
    });
    Ok(())
}

fn run(queue: &Queue, count: Option<usize>) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut received = 0usize;
    let mut bytes = 0usize;

    while count.map_or(true, |n| received < n) {
        let payload = queue.receive()?;
        received += 1;
        bytes += payload.len();
        let preview_len = payload.len().min(32);
        debug!(
            seq = received,
            len = payload.len(),
            preview = %String::from_utf8_lossy(&payload[..preview_len]),
            "received"
        );
    }

    let duration = start.elapsed();
    info!(
        queue = %queue.name(),
        messages = received,
        bytes,
        elapsed = ?duration,
        "done"
    );
    Ok(())
}
